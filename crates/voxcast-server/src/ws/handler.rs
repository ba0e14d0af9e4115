//! WebSocket signaling handler
//!
//! One socket per client. The first request must be `identify`; every
//! later request is dispatched to the SFU managers and answered with a
//! response envelope carrying the request's correlation id. Server events
//! ride the same socket through the connection manager.

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use voxcast_protocol::{
    ChannelKey, ClientRequest, ErrorKind, ErrorPayload, PeerId, RequestEnvelope, RequestResult,
    ResponsePayload, ServerMessage,
};

use crate::error::SfuError;
use crate::state::AppState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // The first request on a socket must be identify.
    let first = match receiver.next().await {
        Some(Ok(Message::Text(text))) => text,
        _ => {
            tracing::warn!("socket closed before identification");
            return;
        }
    };
    let envelope: RequestEnvelope = match serde_json::from_str(&first) {
        Ok(envelope) => envelope,
        Err(error) => {
            tracing::warn!(%error, "malformed identify request");
            return;
        }
    };
    let peer_id = match envelope.request {
        ClientRequest::Identify { ref token } => match state.directory.resolve(token) {
            Some(peer_id) => peer_id,
            None => {
                send_response(
                    &mut sender,
                    envelope.id,
                    RequestResult::Error(ErrorPayload {
                        kind: ErrorKind::InvalidRequest,
                        error: "unrecognized token".to_string(),
                    }),
                )
                .await;
                return;
            }
        },
        _ => {
            send_response(
                &mut sender,
                envelope.id,
                RequestResult::Error(ErrorPayload {
                    kind: ErrorKind::InvalidRequest,
                    error: "first request must be identify".to_string(),
                }),
            )
            .await;
            return;
        }
    };

    if !send_response(
        &mut sender,
        envelope.id,
        RequestResult::Ok(ResponsePayload::Identified { peer_id }),
    )
    .await
    {
        return;
    }
    tracing::info!(%peer_id, "peer identified");

    let connection_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    state
        .connections
        .add_connection(connection_id, peer_id, tx)
        .await;
    state.registry.ensure_session(peer_id).await;

    // Forward queued outbound messages (responses and events) to the socket.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = receiver.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let envelope: RequestEnvelope = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(error) => {
                tracing::warn!(%peer_id, %error, "malformed request");
                // Best effort at correlation so the client does not hang.
                let id = serde_json::from_str::<serde_json::Value>(&text)
                    .ok()
                    .and_then(|value| value.get("id").and_then(|id| id.as_u64()))
                    .unwrap_or(0);
                let result = RequestResult::Error(ErrorPayload {
                    kind: ErrorKind::InvalidRequest,
                    error: error.to_string(),
                });
                state
                    .connections
                    .send_to_connection(connection_id, &ServerMessage::Response { id, result })
                    .await;
                continue;
            }
        };

        let result = match dispatch(&state, peer_id, envelope.request).await {
            Ok(payload) => RequestResult::Ok(payload),
            Err(error) => {
                tracing::warn!(%peer_id, %error, "request failed");
                RequestResult::Error(error.to_payload())
            }
        };
        state
            .connections
            .send_to_connection(
                connection_id,
                &ServerMessage::Response {
                    id: envelope.id,
                    result,
                },
            )
            .await;
    }

    send_task.abort();
    state.connections.remove_connection(connection_id).await;

    // Tear down media only when the peer's last connection is gone.
    if !state.connections.is_peer_online(peer_id).await {
        state.transports.close_peer(peer_id).await;
    }
}

async fn send_response(
    sender: &mut (impl SinkExt<Message> + Unpin),
    id: u64,
    result: RequestResult,
) -> bool {
    let message = ServerMessage::Response { id, result };
    let json = match serde_json::to_string(&message) {
        Ok(json) => json,
        Err(error) => {
            tracing::error!(%error, "failed to serialize response");
            return false;
        }
    };
    sender.send(Message::Text(json.into())).await.is_ok()
}

async fn dispatch(
    state: &AppState,
    peer_id: PeerId,
    request: ClientRequest,
) -> crate::error::Result<ResponsePayload> {
    match request {
        ClientRequest::Identify { .. } => Err(SfuError::InvalidRequest(
            "connection is already identified".to_string(),
        )),

        ClientRequest::CreateTransport {
            direction,
            channel_type,
            channel_id,
            sctp_capabilities,
        } => {
            let channel = ChannelKey::from_parts(&channel_type, channel_id.as_deref());
            let transport_options = state
                .transports
                .create_transport(peer_id, direction, channel, sctp_capabilities)
                .await?;
            Ok(ResponsePayload::TransportCreated { transport_options })
        }

        ClientRequest::ConnectTransport {
            transport_id,
            dtls_parameters,
        } => {
            state
                .transports
                .connect_transport(transport_id, dtls_parameters)
                .await?;
            Ok(ResponsePayload::Connected { connected: true })
        }

        ClientRequest::Produce {
            transport_id,
            kind,
            rtp_parameters,
            media_tag,
            paused,
            app_data: _,
        } => {
            let producer_id = state
                .producers
                .produce(peer_id, transport_id, kind, rtp_parameters, media_tag, paused)
                .await?;
            Ok(ResponsePayload::Produced { id: producer_id.0 })
        }

        ClientRequest::ProduceData {
            transport_id,
            label,
            protocol,
            sctp_stream_parameters,
            app_data: _,
        } => {
            let data_producer_id = state
                .producers
                .produce_data(peer_id, transport_id, label, protocol, sctp_stream_parameters)
                .await?;
            Ok(ResponsePayload::Produced {
                id: data_producer_id.0,
            })
        }

        ClientRequest::Consume {
            media_peer_id,
            media_tag,
            rtp_capabilities,
            channel_type,
            channel_id,
        } => {
            let channel = ChannelKey::from_parts(&channel_type, channel_id.as_deref());
            let descriptor = state
                .consumers
                .consume(peer_id, media_peer_id, media_tag, rtp_capabilities, channel)
                .await?;
            Ok(ResponsePayload::ConsumerCreated {
                producer_id: descriptor.producer_id,
                id: descriptor.id,
                kind: descriptor.kind,
                rtp_parameters: descriptor.rtp_parameters,
                consumer_type: descriptor.consumer_type,
                producer_paused: descriptor.producer_paused,
            })
        }

        ClientRequest::PauseProducer {
            producer_id,
            global_mute,
        } => {
            state
                .producers
                .pause_producer(producer_id, global_mute)
                .await?;
            Ok(ResponsePayload::Paused { paused: true })
        }

        ClientRequest::ResumeProducer { producer_id } => {
            state.producers.resume_producer(producer_id).await?;
            Ok(ResponsePayload::Resumed { resumed: true })
        }

        ClientRequest::CloseProducer { producer_id } => {
            state
                .producers
                .close_producer_and_pipes(producer_id)
                .await?;
            Ok(ResponsePayload::Closed { closed: true })
        }

        ClientRequest::PauseConsumer { consumer_id } => {
            state.consumers.pause_consumer(consumer_id).await?;
            Ok(ResponsePayload::Paused { paused: true })
        }

        ClientRequest::ResumeConsumer { consumer_id } => {
            state.consumers.resume_consumer(consumer_id).await?;
            Ok(ResponsePayload::Resumed { resumed: true })
        }

        ClientRequest::CloseConsumer { consumer_id } => {
            state.consumers.close_consumer(consumer_id).await?;
            Ok(ResponsePayload::Closed { closed: true })
        }

        ClientRequest::SetConsumerLayers {
            consumer_id,
            spatial_layer,
        } => {
            state
                .consumers
                .set_preferred_layer(consumer_id, spatial_layer)
                .await?;
            Ok(ResponsePayload::LayersSet { layers_set: true })
        }

        ClientRequest::CloseTransport { transport_id } => {
            state.transports.close_transport(transport_id).await?;
            Ok(ResponsePayload::Closed { closed: true })
        }

        ClientRequest::RequestCurrentProducers {
            user_ids,
            channel_type,
            channel_id,
        } => {
            let channel = ChannelKey::from_parts(&channel_type, channel_id.as_deref());
            state
                .producers
                .send_current_producers(peer_id, &user_ids, &channel)
                .await;
            Ok(ResponsePayload::Requested { requested: true })
        }
    }
}
