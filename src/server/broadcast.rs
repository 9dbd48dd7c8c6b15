//! Fan-out of one message to many sessions.

use std::sync::Arc;

use crate::protocol::Message;

use super::session::Session;

/// Outcome of a broadcast.
#[derive(Debug, Default)]
pub struct Delivery {
    pub delivered: usize,
    /// Sessions that could not take the message; they are closed.
    pub failed: Vec<Arc<Session>>,
}

/// Send `message` to every session. A failure only affects its own
/// recipient; the rest still get the message.
pub fn broadcast<'a, I>(message: &Message, sessions: I) -> Delivery
where
    I: IntoIterator<Item = &'a Arc<Session>>,
{
    let mut delivery = Delivery::default();

    for session in sessions {
        match session.send(message.clone()) {
            Ok(()) => delivery.delivered += 1,
            Err(e) => {
                log::debug!("Dropping {} from {} broadcast: {}", session.label(), message.kind(), e);
                session.close();
                delivery.failed.push(Arc::clone(session));
            }
        }
    }

    delivery
}
