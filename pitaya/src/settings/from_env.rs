use super::{Settings, SettingsError};

const PREFIX: &str = "NATS_";

pub(super) fn from_vars<I>(vars: I) -> Result<Settings, SettingsError>
where
    I: IntoIterator<Item = (String, String)>,
{
    envy::prefixed(PREFIX)
        .from_iter::<_, Settings>(vars)
        .map_err(SettingsError::Env)?
        .validate()
}
