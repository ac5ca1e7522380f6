//! Fan-out over a link's destinations.
//!
//! Transports that shard register, command and data traffic across several
//! independent physical channels appear here as an array of destinations;
//! transmits route by the index byte of the routing word, receives sweep
//! every destination in turn.

use std::sync::Arc;

use crate::dest::{Destination, RxFrame, TransportError, TxFrame, TxResult};

/// Hard cap on destinations per link; the routing word indexes them with
/// one byte and index 255 is reserved.
const MAX_DESTS: usize = 255;

pub(crate) struct DestinationSet {
    dests: Vec<Arc<dyn Destination>>,
}

impl DestinationSet {
    pub(crate) fn new(dests: Vec<Arc<dyn Destination>>) -> Self {
        assert!(
            dests.len() <= MAX_DESTS,
            "at most {MAX_DESTS} destinations per link"
        );
        Self { dests }
    }

    pub(crate) fn len(&self) -> usize {
        self.dests.len()
    }

    pub(crate) fn get(&self, index: usize) -> Result<&Arc<dyn Destination>, TransportError> {
        self.dests.get(index).ok_or(TransportError::NotOpen)
    }

    /// Opens every destination, stamping each with its index. Any failure
    /// closes the already-opened prefix before returning.
    pub(crate) async fn open_all(&self, max_frame: usize) -> Result<(), TransportError> {
        for (index, dest) in self.dests.iter().enumerate() {
            if let Err(e) = dest.open(index as u32, max_frame).await {
                for opened in &self.dests[..index] {
                    opened.close().await;
                }
                return Err(e);
            }
        }
        Ok(())
    }

    pub(crate) async fn close_all(&self) {
        for dest in &self.dests {
            dest.close().await;
        }
    }

    /// Routes one frame to the destination its routing word selects.
    pub(crate) async fn transmit(&self, frame: TxFrame) -> Result<TxResult, TransportError> {
        let dest = self.get(frame.routing.index())?;
        dest.transmit(frame).await
    }

    /// Polls every destination once, delivering each produced frame (or
    /// receive error) to `sink`. Returns the number of frames produced, so
    /// the caller can idle when a sweep comes back empty.
    pub(crate) async fn sweep<F>(&self, mut sink: F) -> usize
    where
        F: FnMut(usize, Result<RxFrame, TransportError>),
    {
        let mut produced = 0;
        for (index, dest) in self.dests.iter().enumerate() {
            match dest.receive().await {
                Ok(Some(frame)) => {
                    produced += 1;
                    sink(index, Ok(frame));
                }
                Ok(None) => {}
                Err(e) => {
                    produced += 1;
                    sink(index, Err(e));
                }
            }
        }
        produced
    }
}
