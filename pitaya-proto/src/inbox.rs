use std::fmt::Write;

use rand::RngCore;
use watermelon_proto::Subject;

/// Create a process unique subject living under `prefix`
///
/// The suffix is 128 random bits rendered as hex, so two inboxes created from the
/// same prefix never collide in practice.
#[must_use]
pub fn create_inbox_subject(prefix: &Subject) -> Subject {
    let mut suffix = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut suffix);

    let mut subject = String::with_capacity(prefix.len() + ".".len() + (suffix.len() * 2));
    // Writing to a `String` can't fail
    let _ = write!(
        &mut subject,
        "{}.{:032x}",
        prefix,
        u128::from_ne_bytes(suffix)
    );

    Subject::from_dangerous_value(subject.into())
}
