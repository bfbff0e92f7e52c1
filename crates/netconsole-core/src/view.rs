//! Broadcast + history log of console UI mutations.

use std::{collections::VecDeque, sync::RwLock};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Default number of events kept for late subscribers.
const HISTORY_EVENTS: usize = 4096;

/// Who produced a console line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineOrigin {
    /// Text the user sent.
    Client,
    /// Text printed by the active server.
    Server,
}

/// One UI mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewEvent {
    /// Clear the console.
    Cls,
    /// Append text to the console.
    Line { origin: LineOrigin, text: String },
    /// Offer a copy-to-clipboard token.
    Token { text: String },
    /// Switch to the credential-entry surface.
    LoginOpened { site: String },
    /// Return to the main surface.
    LoginClosed,
    /// Input is disabled while `true`.
    Busy(bool),
    /// Clear the input line.
    InputCleared,
    /// A server broke its display contract.
    Fault { message: String },
}

impl ViewEvent {
    fn clears_history(&self) -> bool {
        matches!(self, Self::Cls)
    }
}

/// Event log with broadcast and history support.
///
/// A UI attaching late replays history and then follows live events. A `Cls`
/// drops everything before it, since nothing earlier is visible anymore.
pub struct ViewLog {
    history: RwLock<VecDeque<ViewEvent>>,
    limit: usize,
    sender: broadcast::Sender<ViewEvent>,
}

impl Default for ViewLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ViewLog {
    /// Create a log with the default history limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(HISTORY_EVENTS)
    }

    /// Create a log keeping at most `limit` events of history.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            history: RwLock::new(VecDeque::with_capacity(32)),
            limit: limit.max(1),
            sender,
        }
    }

    /// Push an event to live listeners and history.
    pub fn push(&self, event: ViewEvent) {
        let _ = self.sender.send(event.clone()); // live listeners

        let mut history = match self.history.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if event.clears_history() {
            history.clear();
        }
        while history.len() >= self.limit {
            history.pop_front();
        }
        history.push_back(event);
    }

    /// Get a receiver for live updates.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ViewEvent> {
        self.sender.subscribe()
    }

    /// Get a snapshot of the history.
    #[must_use]
    pub fn history(&self) -> Vec<ViewEvent> {
        let history = match self.history.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        history.iter().cloned().collect()
    }

    /// Printed console text in order, client and server lines alike.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.history()
            .into_iter()
            .filter_map(|event| match event {
                ViewEvent::Line { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    /// Stream that yields history first, then live updates.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, ViewEvent> {
        let (history, rx) = (self.history(), self.subscribe());

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });

        Box::pin(hist.chain(live))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(text: &str) -> ViewEvent {
        ViewEvent::Line {
            origin: LineOrigin::Server,
            text: text.to_string(),
        }
    }

    #[test]
    fn cls_drops_earlier_history() {
        let log = ViewLog::new();
        log.push(line("one"));
        log.push(ViewEvent::Cls);
        log.push(line("two"));

        assert_eq!(log.history(), vec![ViewEvent::Cls, line("two")]);
        assert_eq!(log.lines(), vec!["two".to_string()]);
    }

    #[test]
    fn history_is_bounded() {
        let log = ViewLog::with_limit(2);
        log.push(line("a"));
        log.push(line("b"));
        log.push(line("c"));

        assert_eq!(log.lines(), vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn stream_replays_history_then_follows() {
        let log = ViewLog::new();
        log.push(line("before"));

        let mut stream = log.history_plus_stream();
        log.push(ViewEvent::Busy(true));

        assert_eq!(stream.next().await, Some(line("before")));
        assert_eq!(stream.next().await, Some(ViewEvent::Busy(true)));
    }
}
