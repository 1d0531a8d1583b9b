use std::fmt::{Debug, Formatter};
use std::future::Future;

use tokio::sync::{mpsc, oneshot};

pub type RpcSender<T> = mpsc::UnboundedSender<T>;
pub type RpcReceiver<T> = mpsc::UnboundedReceiver<T>;

pub fn make_rpc_queue<T>() -> (RpcSender<T>, RpcReceiver<T>) {
    mpsc::unbounded_channel()
}

/// Handed to the process that owns a request, which must answer through it exactly once.
#[must_use = "response token should be used to respond to a request"]
pub struct ResponseToken<T> {
    sender: oneshot::Sender<T>,
}

impl<T> Debug for ResponseToken<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("ResponseToken")
    }
}

impl<T> ResponseToken<T> {
    pub fn respond(self, response: T) {
        if self.sender.send(response).is_err() {
            log::warn!("Could not send response to RPC method, the other end hang up");
        }
    }
}

/// Sends a request carrying a fresh [`ResponseToken`] into `queue` and returns a future
/// that resolves with the response. If the owning process has already stopped, the future
/// resolves to `None`.
pub fn initiate_request<Msg, Response, F>(
    queue: &RpcSender<Msg>,
    make_request: F,
) -> impl Future<Output = Option<Response>> + use<Msg, Response, F>
where
    F: FnOnce(ResponseToken<Response>) -> Msg,
{
    let (tx, rx) = oneshot::channel::<Response>();
    if queue.send(make_request(ResponseToken { sender: tx })).is_err() {
        log::warn!("Could not make RPC request, the receiving process has ended");
    }
    async move { rx.await.ok() }
}

#[cfg(test)]
mod tests {
    use super::{initiate_request, make_rpc_queue};

    #[tokio::test]
    async fn request_is_answered_through_token() {
        let (tx, mut rx) = make_rpc_queue::<super::ResponseToken<u32>>();
        let response = initiate_request(&tx, |token| token);
        rx.recv().await.unwrap().respond(42);
        assert_eq!(response.await, Some(42));
    }

    #[tokio::test]
    async fn closed_queue_resolves_to_none() {
        let (tx, rx) = make_rpc_queue::<super::ResponseToken<u32>>();
        drop(rx);
        assert_eq!(initiate_request(&tx, |token| token).await, None);
    }
}
