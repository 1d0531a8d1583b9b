use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};
use futures::future::ready;
use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::common::error::RequestError;
use crate::common::rpc::initiate_request;
use crate::gateway::messages::{
    FromJobManagerMessage, RequestMessage, ResponseMessage, ToJobManagerMessage,
};
use crate::server::reconciler::{ReconcilerMessage, ReconcilerSender};

type Codec = Framed<TcpStream, LengthDelimitedCodec>;

/// Length delimited frames carrying JSON messages.
pub struct Connection<ReceiveMsg, SendMsg> {
    writer: SplitSink<Codec, Bytes>,
    reader: SplitStream<Codec>,
    _r: PhantomData<ReceiveMsg>,
    _s: PhantomData<SendMsg>,
}

pub type GatewayConnection = Connection<FromJobManagerMessage, ToJobManagerMessage>;

impl<R: DeserializeOwned, S: Serialize> Connection<R, S> {
    pub fn new(socket: TcpStream) -> Self {
        let (writer, reader) = Framed::new(socket, LengthDelimitedCodec::new()).split();
        Self {
            writer,
            reader,
            _r: Default::default(),
            _s: Default::default(),
        }
    }

    pub async fn send(&mut self, item: S) -> crate::Result<()> {
        let data = serialize_message(item)?;
        self.writer.send(data).await?;
        Ok(())
    }

    pub async fn receive(&mut self) -> Option<crate::Result<R>> {
        self.reader.next().await.map(deserialize_message)
    }

    pub fn split(
        self,
    ) -> (
        impl Sink<S, Error = crate::Error>,
        impl Stream<Item = crate::Result<R>>,
    ) {
        let Connection { reader, writer, .. } = self;
        let sink = writer.with(|msg| ready(serialize_message(msg)));
        let stream = reader.map(deserialize_message);
        (sink, stream)
    }
}

fn serialize_message<S: Serialize>(item: S) -> crate::Result<Bytes> {
    Ok(serde_json::to_vec(&item)?.into())
}

fn deserialize_message<R: DeserializeOwned>(
    message: Result<BytesMut, std::io::Error>,
) -> crate::Result<R> {
    let message = message?;
    serde_json::from_slice(&message)
        .map_err(|error| crate::Error::DeserializationError(error.to_string()))
}

/// Accepts job manager connections and fans notifications out to all of them.
pub async fn gateway_process(
    listener: TcpListener,
    reconciler: ReconcilerSender,
    mut notifications: UnboundedReceiver<ToJobManagerMessage>,
) {
    let mut outputs: Vec<UnboundedSender<ToJobManagerMessage>> = Vec::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, address)) => {
                    log::info!("Job manager connected from {address}");
                    let (sender, receiver) = unbounded_channel();
                    outputs.push(sender.clone());
                    tokio::task::spawn_local(handle_connection(
                        socket,
                        reconciler.clone(),
                        sender,
                        receiver,
                    ));
                }
                Err(error) => log::error!("Cannot accept job manager connection: {error}"),
            },
            notification = notifications.recv() => {
                let Some(notification) = notification else {
                    break;
                };
                outputs.retain(|output| !output.is_closed());
                if outputs.is_empty() {
                    log::debug!("No job manager is attached, dropping {notification:?}");
                    continue;
                }
                for output in &outputs {
                    let _ = output.send(notification.clone());
                }
            }
        }
    }
}

async fn handle_connection(
    socket: TcpStream,
    reconciler: ReconcilerSender,
    output: UnboundedSender<ToJobManagerMessage>,
    mut queue: UnboundedReceiver<ToJobManagerMessage>,
) {
    let (mut tx, mut rx) = GatewayConnection::new(socket).split();
    let writer = async move {
        while let Some(message) = queue.recv().await {
            if let Err(error) = tx.send(message).await {
                log::error!("Cannot send message to job manager: {error}");
                break;
            }
        }
    };
    let reader = async move {
        while let Some(message) = rx.next().await {
            match message {
                Ok(FromJobManagerMessage::Request(request)) => {
                    tokio::task::spawn_local(handle_request(
                        reconciler.clone(),
                        output.clone(),
                        request,
                    ));
                }
                Ok(FromJobManagerMessage::NotificationFailed(failure)) => {
                    log::warn!(
                        "Job manager could not process {}: {}",
                        failure.topic,
                        failure.errstr
                    );
                }
                Err(error) => {
                    log::error!("Invalid message from job manager: {error}");
                    break;
                }
            }
        }
    };
    tokio::select! {
        _ = writer => {}
        _ = reader => {}
    }
    log::info!("Job manager connection ended");
}

async fn handle_request(
    reconciler: ReconcilerSender,
    output: UnboundedSender<ToJobManagerMessage>,
    message: RequestMessage,
) {
    let RequestMessage {
        request_id,
        request,
    } = message;
    log::debug!("Request {request_id} from job manager: {request:?}");
    let response = initiate_request(&reconciler, |token| {
        ReconcilerMessage::Request(request, token)
    })
    .await
    .unwrap_or_else(|| {
        Err(RequestError::Internal(
            "workflow reconciler is not running".to_string(),
        ))
    });
    let response = ToJobManagerMessage::Response(ResponseMessage::new(request_id, response));
    if output.send(response).is_err() {
        log::warn!("Job manager disconnected before request {request_id} was answered");
    }
}
