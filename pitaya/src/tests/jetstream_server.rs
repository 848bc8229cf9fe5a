use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use data_encoding::BASE64;
use pitaya_proto::jetstream::{ConsumerConfig, DeliverPolicy, StreamConfig};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::Instant;
use watermelon_proto::{StatusCode, Subject};

use super::{memory::subject_matches, MemoryBroker, Reply};
use crate::Message;

const TYPE_PREFIX: &str = "io.nats.jetstream.api.v1";

/// A JetStream server answering on a [`MemoryBroker`]
///
/// Messages published to the subjects of a stream are captured by it.
/// Pull requests without a message available wait until one is published
/// or the request expires.
#[derive(Debug, Clone)]
pub(crate) struct FakeJetstream {
    state: Arc<Mutex<ServerState>>,
}

#[derive(Debug, Default)]
struct ServerState {
    streams: BTreeMap<String, Stream>,
    next_ephemeral: u64,
}

#[derive(Debug)]
struct Stream {
    config: StreamConfig,
    created: DateTime<Utc>,
    last_sequence: u64,
    messages: Vec<Stored>,
    consumers: BTreeMap<String, Consumer>,
}

#[derive(Debug, Clone)]
struct Stored {
    sequence: u64,
    subject: Subject,
    payload: Bytes,
    time: DateTime<Utc>,
}

#[derive(Debug)]
struct Consumer {
    config: ConsumerConfig,
    created: DateTime<Utc>,
    next_sequence: u64,
    delivered: u64,
    ack_pending: BTreeSet<u64>,
    waiting: VecDeque<Waiting>,
}

#[derive(Debug)]
struct Waiting {
    inbox: Subject,
    deadline: Instant,
}

#[derive(Debug, Deserialize)]
struct DurableCreate {
    stream_name: String,
    config: ConsumerConfig,
}

#[derive(Debug, Deserialize)]
struct Pull {
    expires: u64,
    batch: usize,
}

#[derive(Debug, Deserialize)]
struct MessageGet {
    seq: u64,
}

impl FakeJetstream {
    pub(crate) fn start(broker: &MemoryBroker) -> Self {
        let server = Self {
            state: Arc::new(Mutex::new(ServerState::default())),
        };

        let handler = server.clone();
        broker.serve(
            Subject::from_static(">"),
            move |broker: &MemoryBroker, message: &Message| handler.handle(broker, message),
        );
        server
    }

    /// The number of messages `consumer` has yet to deliver
    pub(crate) fn num_pending(&self, stream: &str, consumer: &str) -> usize {
        let state = self.lock();
        let stream = &state.streams[stream];
        pending(&stream.messages, &stream.consumers[consumer])
    }

    fn handle(&self, broker: &MemoryBroker, message: &Message) -> Vec<Reply> {
        let subject = &*message.subject;
        if let Some(api) = subject.strip_prefix("$JS.API.") {
            self.api(api, message)
        } else if let Some(ack) = subject.strip_prefix("$JS.ACK.") {
            self.ack(ack);
            Vec::new()
        } else if subject.starts_with('$') || subject.starts_with('_') {
            Vec::new()
        } else {
            self.capture(broker, message)
        }
    }

    fn api(&self, api: &str, message: &Message) -> Vec<Reply> {
        let tokens = api.split('.').collect::<Vec<_>>();
        let payload = &message.payload;
        let mut state = self.lock();

        let response = match tokens.as_slice() {
            ["INFO"] => json!({
                "type": format!("{TYPE_PREFIX}.account_info_response"),
                "streams": state.streams.len(),
                "consumers": state.streams.values().map(|stream| stream.consumers.len()).sum::<usize>(),
            }),
            ["STREAM", "LIST"] => json!({
                "type": format!("{TYPE_PREFIX}.stream_list_response"),
                "total": state.streams.len(),
                "streams": state
                    .streams
                    .values()
                    .map(|stream| stream_info(stream, None))
                    .collect::<Vec<_>>(),
            }),
            ["STREAM", "CREATE", name] => {
                let config = serde_json::from_slice::<StreamConfig>(payload).unwrap();
                if config.name != *name {
                    error(400, 10056, "stream name in subject does not match request")
                } else if state.streams.contains_key(*name) {
                    error(400, 10058, "stream name already in use")
                } else {
                    let stream = Stream {
                        config,
                        created: Utc::now(),
                        last_sequence: 0,
                        messages: Vec::new(),
                        consumers: BTreeMap::new(),
                    };
                    let response = stream_info(&stream, Some("stream_create_response"));
                    state.streams.insert((*name).to_owned(), stream);
                    response
                }
            }
            ["STREAM", "UPDATE", name] => match state.streams.get_mut(*name) {
                Some(stream) => {
                    stream.config = serde_json::from_slice::<StreamConfig>(payload).unwrap();
                    stream_info(stream, Some("stream_update_response"))
                }
                None => stream_not_found(),
            },
            ["STREAM", "INFO", name] => match state.streams.get(*name) {
                Some(stream) => stream_info(stream, Some("stream_info_response")),
                None => stream_not_found(),
            },
            ["STREAM", "DELETE", name] => match state.streams.remove(*name) {
                Some(_) => json!({
                    "type": format!("{TYPE_PREFIX}.stream_delete_response"),
                    "success": true,
                }),
                None => stream_not_found(),
            },
            ["STREAM", "PURGE", name] => match state.streams.get_mut(*name) {
                Some(stream) => {
                    let purged = stream.messages.len();
                    stream.messages.clear();
                    json!({
                        "type": format!("{TYPE_PREFIX}.stream_purge_response"),
                        "success": true,
                        "purged": purged,
                    })
                }
                None => stream_not_found(),
            },
            ["STREAM", "MSG", "GET", name] => {
                let request = serde_json::from_slice::<MessageGet>(payload).unwrap();
                match state.streams.get(*name) {
                    Some(_) if request.seq == 0 => error(400, 10003, "bad request"),
                    Some(stream) => match stream
                        .messages
                        .iter()
                        .find(|stored| stored.sequence == request.seq)
                    {
                        Some(stored) => json!({
                            "type": format!("{TYPE_PREFIX}.stream_msg_get_response"),
                            "message": {
                                "subject": &*stored.subject,
                                "seq": stored.sequence,
                                "data": BASE64.encode(&stored.payload),
                                "time": stored.time,
                            },
                        }),
                        None => error(404, 10037, "no message found"),
                    },
                    None => stream_not_found(),
                }
            }
            ["CONSUMER", "CREATE", stream] => {
                let raw = serde_json::from_slice::<Value>(payload).unwrap();
                // Ephemeral consumers get the bare configuration
                assert!(raw.get("config").is_none() && raw.get("stream_name").is_none());
                let config = serde_json::from_value::<ConsumerConfig>(raw).unwrap();

                state.next_ephemeral += 1;
                let name = format!("EPH{}", state.next_ephemeral);
                create_consumer(&mut state, stream, name, config)
            }
            ["CONSUMER", "DURABLE", "CREATE", stream, durable_name] => {
                let request = serde_json::from_slice::<DurableCreate>(payload).unwrap();
                assert_eq!(*stream, request.stream_name);
                assert_eq!(Some(*durable_name), request.config.durable_name.as_deref());
                create_consumer(&mut state, stream, (*durable_name).to_owned(), request.config)
            }
            ["CONSUMER", "LIST", stream] => match state.streams.get(*stream) {
                Some(stream) => json!({
                    "type": format!("{TYPE_PREFIX}.consumer_list_response"),
                    "total": stream.consumers.len(),
                    "consumers": stream
                        .consumers
                        .iter()
                        .map(|(name, consumer)| consumer_info(stream, name, consumer, None))
                        .collect::<Vec<_>>(),
                }),
                None => stream_not_found(),
            },
            ["CONSUMER", "INFO", stream, consumer] => match state.streams.get(*stream) {
                Some(stream) => match stream.consumers.get(*consumer) {
                    Some(info) => {
                        consumer_info(stream, consumer, info, Some("consumer_info_response"))
                    }
                    None => consumer_not_found(),
                },
                None => stream_not_found(),
            },
            ["CONSUMER", "DELETE", stream, consumer] => match state.streams.get_mut(*stream) {
                Some(stream) => match stream.consumers.remove(*consumer) {
                    Some(_) => json!({
                        "type": format!("{TYPE_PREFIX}.consumer_delete_response"),
                        "success": true,
                    }),
                    None => consumer_not_found(),
                },
                None => stream_not_found(),
            },
            ["CONSUMER", "MSG", "NEXT", stream_name, consumer_name] => {
                let request = serde_json::from_slice::<Pull>(payload).unwrap();
                assert_eq!(1, request.batch);
                let Some(inbox) = message.reply_subject.clone() else {
                    return Vec::new();
                };

                let Some(stream) = state.streams.get_mut(*stream_name) else {
                    return vec![Reply::status(StatusCode::NOT_FOUND)];
                };
                let Some(consumer) = stream.consumers.get_mut(*consumer_name) else {
                    return vec![Reply::status(StatusCode::NOT_FOUND)];
                };

                return match next(&stream.messages, consumer, stream_name, consumer_name) {
                    Some(reply) => vec![reply],
                    None => {
                        consumer.waiting.push_back(Waiting {
                            inbox,
                            deadline: Instant::now() + Duration::from_nanos(request.expires),
                        });
                        Vec::new()
                    }
                };
            }
            _ => error(400, 10003, "unknown api"),
        };
        drop(state);

        vec![Bytes::from(serde_json::to_vec(&response).unwrap()).into()]
    }

    fn capture(&self, broker: &MemoryBroker, message: &Message) -> Vec<Reply> {
        let mut deliveries = Vec::new();
        let ack = {
            let mut state = self.lock();
            let Some((name, stream)) = state.streams.iter_mut().find(|(_, stream)| {
                stream
                    .config
                    .subjects
                    .iter()
                    .any(|subject| subject_matches(subject, &message.subject))
            }) else {
                return Vec::new();
            };

            stream.last_sequence += 1;
            stream.messages.push(Stored {
                sequence: stream.last_sequence,
                subject: message.subject.clone(),
                payload: message.payload.clone(),
                time: Utc::now(),
            });

            for (consumer_name, consumer) in &mut stream.consumers {
                while let Some(waiting) = consumer.waiting.pop_front() {
                    let expired = waiting.deadline <= Instant::now();
                    if expired || !broker.has_subscribers(&waiting.inbox) {
                        continue;
                    }

                    match next(&stream.messages, consumer, name, consumer_name) {
                        Some(reply) => deliveries.push((waiting.inbox, reply)),
                        None => consumer.waiting.push_front(waiting),
                    }
                    break;
                }
            }

            json!({ "stream": name, "seq": stream.last_sequence })
        };

        for (inbox, reply) in deliveries {
            broker.deliver(&inbox, reply.into_message(&inbox));
        }
        vec![Bytes::from(serde_json::to_vec(&ack).unwrap()).into()]
    }

    fn ack(&self, ack: &str) {
        // {stream}.{consumer}.{delivered}.{stream_seq}.{consumer_seq}.{timestamp}.{pending}
        let tokens = ack.split('.').collect::<Vec<_>>();
        assert_eq!(7, tokens.len(), "malformed ack subject {ack}");
        let sequence = tokens[3].parse::<u64>().unwrap();

        let mut state = self.lock();
        if let Some(consumer) = state
            .streams
            .get_mut(tokens[0])
            .and_then(|stream| stream.consumers.get_mut(tokens[1]))
        {
            consumer.ack_pending.remove(&sequence);
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn create_consumer(
    state: &mut ServerState,
    stream: &str,
    name: String,
    config: ConsumerConfig,
) -> Value {
    let Some(stream) = state.streams.get_mut(stream) else {
        return stream_not_found();
    };

    let next_sequence = match config.deliver_policy {
        DeliverPolicy::All => 1,
        DeliverPolicy::Last => stream.last_sequence.max(1),
        DeliverPolicy::New => stream.last_sequence + 1,
        DeliverPolicy::StartSequence { sequence } => sequence,
        DeliverPolicy::StartTime { from } => stream
            .messages
            .iter()
            .find(|stored| stored.time >= from)
            .map_or(stream.last_sequence + 1, |stored| stored.sequence),
    };
    let consumer = Consumer {
        config,
        created: Utc::now(),
        next_sequence,
        delivered: 0,
        ack_pending: BTreeSet::new(),
        waiting: VecDeque::new(),
    };
    let response = consumer_info(stream, &name, &consumer, Some("consumer_create_response"));
    stream.consumers.insert(name, consumer);
    response
}

/// The next message of `consumer`, advancing its cursor
fn next(messages: &[Stored], consumer: &mut Consumer, stream: &str, name: &str) -> Option<Reply> {
    let next_sequence = consumer.next_sequence;
    let filter = consumer.config.filter_subject.as_deref();
    let stored = messages
        .iter()
        .find(|stored| stored.sequence >= next_sequence && filtered(filter, stored))?;

    consumer.next_sequence = stored.sequence + 1;
    consumer.delivered += 1;
    consumer.ack_pending.insert(stored.sequence);
    let ack = format!(
        "$JS.ACK.{stream}.{name}.1.{}.{}.{}.{}",
        stored.sequence,
        consumer.delivered,
        stored.time.timestamp_nanos_opt().unwrap(),
        pending(messages, consumer),
    );
    Some(Reply::message(
        stored.subject.clone(),
        Some(Subject::try_from(ack).unwrap()),
        stored.payload.clone(),
    ))
}

fn pending(messages: &[Stored], consumer: &Consumer) -> usize {
    let filter = consumer.config.filter_subject.as_deref();
    messages
        .iter()
        .filter(|stored| stored.sequence >= consumer.next_sequence && filtered(filter, stored))
        .count()
}

fn filtered(filter: Option<&str>, stored: &Stored) -> bool {
    filter.map_or(true, |filter| subject_matches(filter, &stored.subject))
}

fn stream_info(stream: &Stream, response_type: Option<&str>) -> Value {
    let mut info = json!({
        "config": stream.config,
        "created": stream.created,
        "state": {
            "messages": stream.messages.len(),
            "first_seq": stream.messages.first().map_or(0, |stored| stored.sequence),
            "last_seq": stream.last_sequence,
            "consumer_count": stream.consumers.len(),
        },
    });
    if let Some(response_type) = response_type {
        info["type"] = format!("{TYPE_PREFIX}.{response_type}").into();
    }
    info
}

fn consumer_info(
    stream: &Stream,
    name: &str,
    consumer: &Consumer,
    response_type: Option<&str>,
) -> Value {
    let mut info = json!({
        "stream_name": stream.config.name,
        "name": name,
        "created": consumer.created,
        "config": consumer.config,
        "delivered": {
            "consumer_seq": consumer.delivered,
            "stream_seq": consumer.next_sequence.saturating_sub(1),
        },
        "num_ack_pending": consumer.ack_pending.len(),
        "num_pending": pending(&stream.messages, consumer),
        "num_waiting": consumer.waiting.len(),
    });
    if let Some(response_type) = response_type {
        info["type"] = format!("{TYPE_PREFIX}.{response_type}").into();
    }
    info
}

fn error(code: u16, err_code: u16, description: &str) -> Value {
    json!({
        "type": format!("{TYPE_PREFIX}.error_response"),
        "error": { "code": code, "err_code": err_code, "description": description },
    })
}

fn stream_not_found() -> Value {
    error(404, 10059, "stream not found")
}

fn consumer_not_found() -> Value {
    error(404, 10014, "consumer not found")
}
