use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use http_body::Body;
use pin_project_lite::pin_project;
use tokio::time::{Instant, Sleep, sleep, sleep_until};

/// BodyTimeout bounds how long a response body may go without producing a frame. Upgraded
/// connections and requests with no configured endpoint timeout use `None`.
pub enum BodyTimeout {
	Duration(Duration),
	Deadline(Instant),
	None,
}

impl BodyTimeout {
	pub fn apply(self, r: crate::http::Response) -> crate::http::Response {
		match self {
			BodyTimeout::None => r,
			t => r.map(|b| crate::http::Body::new(TimeoutBody::new(t, b))),
		}
	}
}

pin_project! {
	pub struct TimeoutBody<B> {
		timeout: BodyTimeout,
		#[pin]
		sleep: Option<Sleep>,
		#[pin]
		body: B,
	}
}

impl<B> TimeoutBody<B> {
	pub fn new(timeout: BodyTimeout, body: B) -> Self {
		TimeoutBody {
			timeout,
			sleep: None,
			body,
		}
	}
}

impl<B> Body for TimeoutBody<B>
where
	B: Body,
	B::Error: Into<axum_core::BoxError>,
{
	type Data = B::Data;
	type Error = Box<dyn std::error::Error + Send + Sync>;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
		let mut this = self.project();

		// Start the `Sleep` if not active.
		let sleep_pinned = if let Some(some) = this.sleep.as_mut().as_pin_mut() {
			Some(some)
		} else {
			match this.timeout {
				BodyTimeout::Duration(d) => {
					this.sleep.set(Some(sleep(*d)));
				},
				BodyTimeout::Deadline(d) => {
					this.sleep.set(Some(sleep_until(*d)));
				},
				BodyTimeout::None => {},
			}
			this.sleep.as_mut().as_pin_mut()
		};

		if let Some(sleep_pinned) = sleep_pinned
			&& let Poll::Ready(()) = sleep_pinned.poll(cx)
		{
			return Poll::Ready(Some(Err(Box::new(TimeoutError(())))));
		}

		// Check for body data.
		let frame = ready!(this.body.poll_frame(cx));
		// A frame is ready. Reset the `Sleep`...
		this.sleep.set(None);

		Poll::Ready(frame.transpose().map_err(Into::into).transpose())
	}
}

/// Error for [`TimeoutBody`].
#[derive(Debug)]
pub struct TimeoutError(());

impl std::error::Error for TimeoutError {}

impl std::fmt::Display for TimeoutError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "data was not received within the designated timeout")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use bytes::Bytes;
	use http_body::Frame;
	use http_body_util::BodyExt;
	use pin_project_lite::pin_project;
	use std::error::Error;
	use std::fmt::Display;

	#[derive(Debug)]
	struct MockError;

	impl Error for MockError {}

	impl Display for MockError {
		fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
			write!(f, "mock error")
		}
	}

	pin_project! {
		struct MockBody {
			#[pin]
			sleep: Sleep
		}
	}

	impl Body for MockBody {
		type Data = Bytes;
		type Error = MockError;

		fn poll_frame(
			self: Pin<&mut Self>,
			cx: &mut Context<'_>,
		) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
			let this = self.project();
			this
				.sleep
				.poll(cx)
				.map(|_| Some(Ok(Frame::data(vec![].into()))))
		}
	}

	#[tokio::test]
	async fn body_available_within_timeout() {
		let mock_sleep = Duration::from_millis(100);
		let timeout_sleep = Duration::from_millis(500);

		let mock_body = MockBody {
			sleep: sleep(mock_sleep),
		};
		let timeout_body = TimeoutBody::new(BodyTimeout::Duration(timeout_sleep), mock_body);

		assert!(
			timeout_body
				.boxed()
				.frame()
				.await
				.expect("no frame")
				.is_ok()
		);
	}

	#[tokio::test]
	async fn body_unavailable_within_timeout_errors() {
		let mock_sleep = Duration::from_millis(500);
		let timeout_sleep = Duration::from_millis(100);

		let mock_body = MockBody {
			sleep: sleep(mock_sleep),
		};
		let timeout_body = TimeoutBody::new(BodyTimeout::Duration(timeout_sleep), mock_body);

		assert!(timeout_body.boxed().frame().await.unwrap().is_err());
	}
}
