//! Routing of classified events to their recipients.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
    connection::{Connection, Frame},
    event::Event,
    message::{Control, timestamp},
    registry::Registry,
};

/// Delivery tally for one routed event.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Fanout {
    pub delivered: usize,
    pub skipped: usize,
}

pub struct Broadcaster {
    registry: Arc<Registry>,
}

impl Broadcaster {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Routes `event`, which arrived on `origin`.
    ///
    /// A join only names the origin. Typing, chat and opaque payloads go to
    /// every other live connection. Delivery is best effort: an unwritable
    /// recipient is skipped and nothing is reported back to the origin.
    pub async fn route(&self, origin: &Connection, event: Event) -> Fanout {
        match event {
            Event::Join { user, time } => {
                if origin.set_display_name(user.clone()) {
                    info!(conn_id = origin.id(), %user, joined_at = %timestamp(time), "user joined");
                } else {
                    warn!(
                        conn_id = origin.id(),
                        current = origin.name_or_unknown(),
                        requested = %user,
                        "ignoring repeated join"
                    );
                }
                Fanout::default()
            }
            Event::Typing { user, typing } => {
                let notice = Control::Typing { user, typing };
                match serde_json::to_string(&notice) {
                    Ok(json) => self.fan_out(origin, Frame::Text(json.into())).await,
                    Err(error) => {
                        warn!(conn_id = origin.id(), ?error, "failed to encode typing notice");
                        Fanout::default()
                    }
                }
            }
            Event::Chat { raw, fields } => {
                info!(
                    conn_id = origin.id(),
                    user = fields.get("user").and_then(|u| u.as_str()).unwrap_or_default(),
                    bytes = raw.len(),
                    "received chat"
                );
                self.fan_out(origin, Frame::Text(raw.into())).await
            }
            Event::Opaque { raw } => {
                debug!(conn_id = origin.id(), ?raw, "received unstructured payload");
                self.fan_out(origin, raw.into()).await
            }
        }
    }

    async fn fan_out(&self, origin: &Connection, frame: Frame) -> Fanout {
        let visit = self
            .registry
            .for_each_except(origin.id(), |peer| {
                peer.send(frame.clone()).inspect_err(|error| {
                    debug!(conn_id = peer.id(), %error, "skipping unreachable peer");
                })
            })
            .await;

        let fanout = Fanout {
            delivered: visit.visited - visit.failed,
            skipped: visit.failed,
        };
        debug!(
            conn_id = origin.id(),
            delivered = fanout.delivered,
            skipped = fanout.skipped,
            "fanout complete"
        );
        fanout
    }
}
