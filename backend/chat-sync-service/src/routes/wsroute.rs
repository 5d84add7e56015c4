use crate::error::AppError;
use crate::middleware::guards::User;
use crate::models::UserId;
use crate::state::AppState;
use crate::websocket::{ConnectionId, WsInboundEvent, WsOutboundEvent};
use actix::{Actor, ActorContext, AsyncContext, StreamHandler};
use actix_web::{get, web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Frame queued by the dispatcher for this connection
struct PushFrame(String);

// WebSocket Actor
struct WsSession {
    connection_id: ConnectionId,
    user_id: UserId,
    state: AppState,
    hb: Instant,
    receiver: Option<mpsc::Receiver<String>>,
}

fn error_event(e: &AppError) -> WsOutboundEvent {
    WsOutboundEvent::Error {
        code: e.code().to_string(),
        message: e.to_string(),
    }
}

impl WsSession {
    fn new(
        connection_id: ConnectionId,
        user_id: UserId,
        state: AppState,
        receiver: mpsc::Receiver<String>,
    ) -> Self {
        Self {
            connection_id,
            user_id,
            state,
            hb: Instant::now(),
            receiver: Some(receiver),
        }
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                tracing::warn!(
                    connection = %act.connection_id,
                    user_id = act.user_id,
                    "websocket heartbeat failed, disconnecting"
                );
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn handle_event(&mut self, event: WsInboundEvent, ctx: &mut ws::WebsocketContext<Self>) {
        let dispatcher = self.state.dispatcher.clone();
        let id = self.connection_id;

        match event {
            WsInboundEvent::Ping => {
                if let Some(frame) = WsOutboundEvent::Pong.to_frame() {
                    ctx.text(frame);
                }
            }
            WsInboundEvent::Subscribe { chat_ids, cursors } => {
                actix::spawn(async move {
                    if let Err(e) = dispatcher.subscribe(id, &chat_ids, &cursors).await {
                        dispatcher.send_event(id, &error_event(&e));
                    }
                });
            }
            WsInboundEvent::Unsubscribe { chat_ids } => {
                actix::spawn(async move {
                    dispatcher.unsubscribe(id, &chat_ids).await;
                });
            }
            WsInboundEvent::Ack { chat_id, cursor } => {
                actix::spawn(async move {
                    if let Err(e) = dispatcher.acknowledge(id, chat_id, cursor).await {
                        tracing::debug!(connection = %id, chat_id, error = %e, "ack rejected");
                        dispatcher.send_event(id, &error_event(&e));
                    }
                });
            }
        }
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!(
            connection = %self.connection_id,
            user_id = self.user_id,
            "websocket session started"
        );
        self.hb(ctx);

        if let Some(receiver) = self.receiver.take() {
            ctx.add_stream(ReceiverStream::new(receiver).map(PushFrame));
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        tracing::info!(
            connection = %self.connection_id,
            user_id = self.user_id,
            "websocket session stopped"
        );
        self.state.dispatcher.disconnect(self.connection_id);
    }
}

// Frames from the dispatcher queue
impl StreamHandler<PushFrame> for WsSession {
    fn handle(&mut self, frame: PushFrame, ctx: &mut Self::Context) {
        ctx.text(frame.0);
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        // Queue closed: the dispatcher dropped this connection
        tracing::info!(connection = %self.connection_id, "push queue closed");
        ctx.stop();
    }
}

// Handle WebSocket protocol messages
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(text)) => {
                self.hb = Instant::now();
                match serde_json::from_str::<WsInboundEvent>(&text) {
                    Ok(event) => self.handle_event(event, ctx),
                    Err(e) => {
                        tracing::warn!(connection = %self.connection_id, error = %e, "failed to parse ws message");
                        let event = error_event(&AppError::BadRequest(format!("invalid frame: {e}")));
                        if let Some(frame) = event.to_frame() {
                            ctx.text(frame);
                        }
                    }
                }
            }
            Ok(ws::Message::Binary(_)) => {
                tracing::warn!("binary websocket messages not supported");
            }
            Ok(ws::Message::Close(reason)) => {
                tracing::info!(connection = %self.connection_id, ?reason, "websocket close received");
                ctx.close(reason);
                ctx.stop();
            }
            Err(e) => {
                tracing::warn!(connection = %self.connection_id, error = %e, "websocket protocol error");
                ctx.stop();
            }
            _ => {}
        }
    }
}

// HTTP handler
#[get("/ws")]
pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    user: User,
) -> Result<HttpResponse, Error> {
    let (connection_id, receiver) = state.dispatcher.connect(user.id);
    let session = WsSession::new(connection_id, user.id, state.get_ref().clone(), receiver);

    ws::start(session, &req, stream).map_err(|e| {
        state.dispatcher.disconnect(connection_id);
        e
    })
}
