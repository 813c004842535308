//! This module contains the [`Subscription`] type through which the collaborators deliver events
//! to the slashers.
use std::{
    pin::Pin,
    task::{Context, Poll},
};

use tokio::sync::mpsc;

/// A stream of events pushed by a chain adapter or a Bitcoin client.
///
/// It is consumed through its [`futures::Stream`] API and ends once the producer drops its
/// sending half.
#[derive(Debug)]
pub struct Subscription<T> {
    receiver: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    /// Wraps the receiving half of a channel fed by a collaborator.
    pub fn from_receiver(receiver: mpsc::UnboundedReceiver<T>) -> Subscription<T> {
        Subscription { receiver }
    }
}

/// Creates a subscription together with the sender a collaborator pushes events into.
pub fn channel<T>() -> (mpsc::UnboundedSender<T>, Subscription<T>) {
    let (send, recv) = mpsc::unbounded_channel();
    (send, Subscription::from_receiver(recv))
}

impl<T> futures::Stream for Subscription<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}
