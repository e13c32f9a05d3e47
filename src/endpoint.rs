use futures::channel::mpsc;
use futures::prelude::*;
use std::sync::Arc;

use crate::client::Client;
use crate::config::Config;
use crate::message::{Packet, Request, Response};
use crate::packet_stream::{NextPacketError, PacketStream};
use crate::service::Service;

/// One side of a connection. Serves `service` to the peer and provides a
/// [Client] for calling the peer.
#[derive(Debug)]
pub struct Endpoint {
    client: Client,
    server_task: async_std::task::JoinHandle<anyhow::Result<()>>,
    packet_reader_task: async_std::task::JoinHandle<anyhow::Result<()>>,
    packet_sender_task: async_std::task::JoinHandle<anyhow::Result<()>>,
}

impl Endpoint {
    pub fn new<Sink_, TryStream_>(
        send: Sink_,
        receive: TryStream_,
        service: Service,
        config: &Config,
    ) -> Self
    where
        Sink_: Sink<Vec<u8>> + Send + Unpin + 'static,
        Sink_::Error: std::error::Error + Send + Sync + 'static,
        TryStream_: TryStream<Ok = Vec<u8>> + Send + Unpin + 'static,
        TryStream_::Error: std::error::Error + Send + Sync + 'static,
    {
        let (in_requests_sender, in_requests_receiver) = mpsc::channel(10);
        let (out_requests_sender, out_requests_receiver) = mpsc::channel(10);
        let (in_responses_sender, in_responses_receiver) = mpsc::channel(10);
        let (out_responses_sender, out_responses_receiver) = mpsc::channel(10);
        let client = Client::new(out_requests_sender, in_responses_receiver, config.client());
        let server_task = async_std::task::spawn(crate::server::run(
            Arc::new(service),
            in_requests_receiver,
            out_responses_sender,
            config.session(),
        ));
        let packet_reader_task = async_std::task::spawn(async move {
            Self::read_packets(receive, in_requests_sender, in_responses_sender).await
        });
        let packet_sender_task = async_std::task::spawn(async move {
            Self::send_packets(
                futures::stream::select(
                    out_requests_receiver.map(Packet::Request),
                    out_responses_receiver.map(Packet::Response),
                ),
                send,
            )
            .await
        });
        Self {
            client,
            server_task,
            packet_reader_task,
            packet_sender_task,
        }
    }

    /// Endpoint that does not offer any operations to the peer.
    pub fn new_client<Sink_, TryStream_>(send: Sink_, receive: TryStream_, config: &Config) -> Self
    where
        Sink_: Sink<Vec<u8>> + Send + Unpin + 'static,
        Sink_::Error: std::error::Error + Send + Sync + 'static,
        TryStream_: TryStream<Ok = Vec<u8>> + Send + Unpin + 'static,
        TryStream_::Error: std::error::Error + Send + Sync + 'static,
    {
        Self::new(send, receive, Service::new(), config)
    }

    pub fn client(&mut self) -> &mut Client {
        &mut self.client
    }

    pub async fn join(self) -> anyhow::Result<()> {
        let Endpoint {
            packet_reader_task,
            packet_sender_task,
            server_task,
            ..
        } = self;
        futures::try_join!(packet_reader_task, packet_sender_task, server_task)?;
        Ok(())
    }

    /// Encode and send `packets`. A packet that cannot be encoded is dropped
    /// and does not affect the other packets.
    async fn send_packets<Sink_>(
        packets: impl Stream<Item = Packet> + Unpin,
        send: Sink_,
    ) -> anyhow::Result<()>
    where
        Sink_: Sink<Vec<u8>> + Unpin,
        Sink_::Error: std::error::Error + Send + Sync + 'static,
    {
        packets
            .filter_map(|packet| {
                let number = match &packet {
                    Packet::Request(request) => request.number(),
                    Packet::Response(response) => response.number(),
                };
                future::ready(match packet.build() {
                    Ok(data) => Some(Ok::<_, anyhow::Error>(data)),
                    Err(error) => {
                        tracing::warn!(number, %error, "dropping packet that cannot be encoded");
                        None
                    }
                })
            })
            .forward(send.sink_map_err(anyhow::Error::from))
            .await
    }

    async fn read_packets<Stream_>(
        receive: Stream_,
        mut request_sender: mpsc::Sender<Request>,
        mut response_sender: mpsc::Sender<Response>,
    ) -> anyhow::Result<()>
    where
        Stream_: TryStream<Ok = Vec<u8>> + Unpin,
        Stream_::Error: std::error::Error + Send + Sync + 'static,
    {
        let mut packet_stream = PacketStream::new(receive);
        while let Some(next_item) = packet_stream.next().await {
            match next_item {
                Ok(Packet::Request(request)) => request_sender.send(request).await?,
                Ok(Packet::Response(response)) => response_sender.send(response).await?,
                Err(NextPacketError::PacketParse(error)) if error.is_invalid_packet() => {
                    tracing::warn!(%error, "skipping invalid packet");
                }
                Err(error) => {
                    tracing::warn!(%error, "failed to read packet, closing endpoint stream");
                    return Err(error.into());
                }
            }
        }
        tracing::debug!("end of endpoint stream");
        Ok(())
    }
}
