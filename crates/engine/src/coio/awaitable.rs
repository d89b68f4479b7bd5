// SPDX-FileCopyrightText: © 2025 AOSL Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! `Future` adapter over the tri-state operations.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use aosl_core::{AoslError, Outcome, Result, Resume, Resumed};
use futures::channel::oneshot;

/// The result of one tri-state operation, as a future.
///
/// Resolves to the operation's result. A free-only resume (the descriptor or
/// guard object went away) resolves to `Canceled`.
#[must_use = "futures do nothing unless polled"]
#[derive(Debug)]
pub struct CoFuture<T> {
    rx: oneshot::Receiver<Resumed<T>>,
    issued: Option<AoslError>,
}

/// Issues an operation with a resume that feeds the returned future.
///
/// The operation starts immediately; awaiting only collects its result.
///
/// ```no_run
/// use aosl_core::{BufRegion, Data};
/// use aosl_engine::coio::{self, awaitable, CoFile};
///
/// # async fn demo() -> aosl_core::Result<()> {
/// let fd = CoFile::open("data.bin")?;
/// let buf = Data::zeroed(64);
/// let n = awaitable(|resume| coio::read(fd, BufRegion::whole(buf.clone()), None, resume)).await?;
/// # let _ = n;
/// # Ok(())
/// # }
/// ```
pub fn awaitable<T, F>(issue: F) -> CoFuture<T>
where
    T: Send + 'static,
    F: FnOnce(Option<Resume<T>>) -> Result<Outcome>,
{
    let (tx, rx) = oneshot::channel();
    let resume: Resume<T> = Box::new(move |resumed| {
        let _ = tx.send(resumed);
    });
    let issued = issue(Some(resume)).err();
    CoFuture { rx, issued }
}

impl<T> Future for CoFuture<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(Resumed::Complete(result))) => Poll::Ready(result),
            Poll::Ready(Ok(Resumed::FreeOnly) | Err(oneshot::Canceled)) => {
                Poll::Ready(Err(self.issued.take().unwrap_or(AoslError::Canceled)))
            },
        }
    }
}
