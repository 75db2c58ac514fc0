//! Futures over the replicated key/value table.
//!
//! Both resolve only as the simulator delivers replica answers, so they are
//! driven with [`Simulator::block_on`](crate::simulator::Simulator::block_on)
//! or polled by hand between steps.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use futures::{
    channel::{mpsc, oneshot},
    StreamExt,
};

use crate::node::dht::DhtValue;

/// Resolves to whether a majority of replicas stored the value. A timeout or a
/// closed node resolves to `false`.
#[derive(Debug)]
pub struct DhtPut {
    rx: oneshot::Receiver<bool>,
}

impl DhtPut {
    pub(crate) fn channel() -> (oneshot::Sender<bool>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }
}

impl Future for DhtPut {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(stored)) => Poll::Ready(stored),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(false),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Resolves to every distinct value the replicas returned, once all of them
/// answered or failed. Values seen so far are available through
/// [`DhtGet::partial`].
#[derive(Debug)]
pub struct DhtGet {
    rx: mpsc::UnboundedReceiver<DhtValue>,
    values: Vec<DhtValue>,
}

impl DhtGet {
    pub(crate) fn channel() -> (mpsc::UnboundedSender<DhtValue>, Self) {
        let (tx, rx) = mpsc::unbounded();
        (
            tx,
            Self {
                rx,
                values: Vec::new(),
            },
        )
    }

    pub fn partial(&self) -> &[DhtValue] {
        &self.values
    }
}

impl Future for DhtGet {
    type Output = Vec<DhtValue>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            match self.rx.poll_next_unpin(cx) {
                Poll::Ready(Some(value)) => self.values.push(value),
                Poll::Ready(None) => return Poll::Ready(std::mem::take(&mut self.values)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::{executor::block_on, FutureExt};

    use super::*;

    #[test]
    fn dropped_put_resolves_false() {
        let (tx, put) = DhtPut::channel();
        drop(tx);
        assert!(!block_on(put));

        let (tx, put) = DhtPut::channel();
        let _ = tx.send(true);
        assert!(block_on(put));
    }

    #[test]
    fn get_keeps_partial_values() {
        let (tx, mut get) = DhtGet::channel();
        let value = DhtValue {
            value: b"v".to_vec(),
            expires_in: Duration::from_secs(1),
        };
        let _ = tx.unbounded_send(value.clone());
        assert!((&mut get).now_or_never().is_none());
        assert_eq!(get.partial(), &[value.clone()]);
        drop(tx);
        assert_eq!(block_on(get), vec![value]);
    }
}
