/// Notification fan-out to the front-end collaborator.
///
/// The core never blocks on a slow or departed consumer: sends are
/// fire-and-forget and a disconnected receiver is logged once at debug.
use crate::types::Notification;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::debug;

#[derive(Clone)]
pub struct Notifier {
    tx: Sender<Notification>,
}

impl Notifier {
    pub fn new(tx: Sender<Notification>) -> Self {
        Self { tx }
    }

    /// Channel pair for embedders that just want to drain events.
    pub fn channel() -> (Notifier, Receiver<Notification>) {
        let (tx, rx) = unbounded();
        (Self::new(tx), rx)
    }

    pub fn emit(&self, event: Notification) {
        if let Err(e) = self.tx.send(event) {
            debug!("notification dropped, receiver gone: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_survives_dropped_receiver() {
        let (notifier, rx) = Notifier::channel();
        drop(rx);
        notifier.emit(Notification::BackupFailed {
            reason: "disk full".to_string(),
        });
    }

    #[test]
    fn cloned_notifiers_feed_the_same_receiver() {
        let (notifier, rx) = Notifier::channel();
        let background = notifier.clone();
        background.emit(Notification::BackupFailed {
            reason: "disk full".to_string(),
        });
        notifier.emit(Notification::ProjectStopped {
            uid: 1,
            project: "alpha".to_string(),
        });
        assert_eq!(rx.try_iter().count(), 2);
    }

    #[test]
    fn events_arrive_in_order() {
        let (notifier, rx) = Notifier::channel();
        notifier.emit(Notification::ProjectStarted {
            uid: 1,
            project: "alpha".to_string(),
            pid: 99,
        });
        notifier.emit(Notification::ProjectStopped {
            uid: 1,
            project: "alpha".to_string(),
        });
        assert!(matches!(
            rx.recv().unwrap(),
            Notification::ProjectStarted { pid: 99, .. }
        ));
        assert!(matches!(
            rx.recv().unwrap(),
            Notification::ProjectStopped { .. }
        ));
    }
}
