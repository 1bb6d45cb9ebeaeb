//! Confirmed state transitions as a [`Stream`].

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::state::StateChange;

/// `Stream` adapter over the confirmed application state, obtained from
/// [`PlatformClient::state_stream`](crate::PlatformClient::state_stream).
///
/// Yields the state as of subscription first, then every confirmed
/// transition. A slow consumer sees the latest transition, not every
/// intermediate one.
pub struct StateStream {
    inner: WatchStream<StateChange>,
}

impl StateStream {
    pub(crate) fn new(receiver: watch::Receiver<StateChange>) -> Self {
        Self {
            inner: WatchStream::new(receiver),
        }
    }
}

impl Stream for StateStream {
    type Item = StateChange;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        // WatchStream<StateChange> is Unpin, so projecting is safe.
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl std::fmt::Debug for StateStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStream").finish_non_exhaustive()
    }
}
