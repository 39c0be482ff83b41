use std::sync::mpsc;

use super::{MarshallingError, Timestamp};

/// A snapshot ordered by a [`Timestamp`].
pub trait Timestamped {
    fn timestamp(&self) -> Timestamp;
}

/// Creates a FIFO channel of snapshots with strictly increasing timestamps.
pub fn snapshot_channel<T: Timestamped>() -> (SnapshotSender<T>, SnapshotReceiver<T>) {
    let (sender, receiver) = mpsc::channel();
    (
        SnapshotSender { sender, last: None },
        SnapshotReceiver { receiver, last: None },
    )
}

/// The sending half of a [`snapshot_channel`].
#[derive(Debug)]
pub struct SnapshotSender<T> {
    sender: mpsc::Sender<T>,
    last: Option<Timestamp>,
}

impl<T: Timestamped> SnapshotSender<T> {
    /// Sends a snapshot.
    ///
    /// Fails if its timestamp does not follow the previously sent one.
    pub fn send(&mut self, snapshot: T) -> Result<(), MarshallingError> {
        let timestamp = snapshot.timestamp();
        if let Some(previous) = self.last.filter(|&previous| timestamp <= previous) {
            return Err(MarshallingError::NonMonotonic {
                previous,
                timestamp,
            });
        }
        self.sender
            .send(snapshot)
            .map_err(|_| MarshallingError::Disconnected)?;
        self.last = Some(timestamp);
        Ok(())
    }

    /// The timestamp of the last sent snapshot.
    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.last
    }
}

/// The receiving half of a [`snapshot_channel`].
#[derive(Debug)]
pub struct SnapshotReceiver<T> {
    receiver: mpsc::Receiver<T>,
    last: Option<Timestamp>,
}

impl<T: Timestamped> SnapshotReceiver<T> {
    /// Receives the oldest pending snapshot, if any.
    pub fn try_recv(&mut self) -> Result<Option<T>, MarshallingError> {
        match self.receiver.try_recv() {
            Ok(snapshot) => {
                let timestamp = snapshot.timestamp();
                if let Some(previous) = self.last.filter(|&previous| timestamp <= previous) {
                    return Err(MarshallingError::NonMonotonic {
                        previous,
                        timestamp,
                    });
                }
                self.last = Some(timestamp);
                Ok(Some(snapshot))
            }
            Err(mpsc::TryRecvError::Empty) => Ok(None),
            Err(mpsc::TryRecvError::Disconnected) => Err(MarshallingError::Disconnected),
        }
    }

    /// Receives every pending snapshot in order.
    ///
    /// A disconnected sender is only an error once nothing is left to receive.
    pub fn drain(&mut self) -> Result<Vec<T>, MarshallingError> {
        let mut snapshots = Vec::new();
        loop {
            match self.try_recv() {
                Ok(Some(snapshot)) => snapshots.push(snapshot),
                Ok(None) => return Ok(snapshots),
                Err(MarshallingError::Disconnected) if !snapshots.is_empty() => {
                    return Ok(snapshots);
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// The timestamp of the last received snapshot.
    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.last
    }
}
