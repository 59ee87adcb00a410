/// WebSocket gateway for live queries
use actix::prelude::*;
use actix_web_actors::ws;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::engine::LivePg;
use crate::error::Result;
use crate::messages::{key_for_columns, ClientMessage, RuleSpec, ServerMessage};
use crate::subscription::{SubscriptionEvent, SubscriptionHandle, TriggerRule};

/// How often heartbeat pings are sent
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// How long before lack of client response causes a timeout
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared state for all WebSocket connections
pub struct AppState {
    pub engine: Arc<LivePg>,
}

impl AppState {
    pub fn new(engine: Arc<LivePg>) -> Self {
        Self { engine }
    }
}

/// Event of one live query, forwarded to the connection that owns it
#[derive(Message)]
#[rtype(result = "()")]
struct Forward {
    id: String,
    event: SubscriptionEvent,
}

/// WebSocket connection actor. Each connection owns its live queries and
/// stops them when it closes.
pub struct LiveQuerySocket {
    hb: Instant,
    state: actix_web::web::Data<AppState>,
    queries: HashMap<String, SubscriptionHandle>,
}

fn send(ctx: &mut ws::WebsocketContext<LiveQuerySocket>, msg: &ServerMessage) {
    match serde_json::to_string(msg) {
        Ok(text) => ctx.text(text),
        Err(e) => warn!("could not encode server message: {e}"),
    }
}

fn build_rules(specs: &[RuleSpec]) -> Result<Vec<TriggerRule>> {
    specs.iter().map(RuleSpec::to_rule).collect()
}

impl LiveQuerySocket {
    pub fn new(state: actix_web::web::Data<AppState>) -> Self {
        Self {
            hb: Instant::now(),
            state,
            queries: HashMap::new(),
        }
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                warn!("WebSocket client heartbeat failed, disconnecting");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn handle_client_message(&mut self, msg: ClientMessage, ctx: &mut ws::WebsocketContext<Self>) {
        match msg {
            ClientMessage::Select {
                id,
                query,
                values,
                key_columns,
                triggers,
                min_interval_ms,
            } => {
                if self.queries.contains_key(&id) {
                    send(
                        ctx,
                        &ServerMessage::Error {
                            id: Some(id),
                            message: "query id already in use".to_string(),
                        },
                    );
                    return;
                }

                let selected = build_rules(&triggers).and_then(|rules| {
                    self.state.engine.select(
                        &query,
                        values,
                        key_for_columns(&key_columns),
                        rules,
                        min_interval_ms.map(Duration::from_millis),
                    )
                });

                match selected {
                    Ok(mut subscription) => {
                        self.queries.insert(id.clone(), subscription.handle());
                        send(ctx, &ServerMessage::Selected { id: id.clone() });

                        let addr = ctx.address();
                        actix::spawn(async move {
                            while let Some(event) = subscription.recv().await {
                                addr.do_send(Forward {
                                    id: id.clone(),
                                    event,
                                });
                            }
                            debug!("live query {id} closed");
                        });
                    }
                    Err(e) => send(
                        ctx,
                        &ServerMessage::Error {
                            id: Some(id),
                            message: e.to_string(),
                        },
                    ),
                }
            }

            ClientMessage::Invalidate { id } => match self.queries.get(&id) {
                Some(handle) => handle.invalidate(),
                None => send(
                    ctx,
                    &ServerMessage::Error {
                        id: Some(id),
                        message: "unknown query id".to_string(),
                    },
                ),
            },

            ClientMessage::Stop { id } => {
                let stopped = self
                    .queries
                    .remove(&id)
                    .is_some_and(|handle| handle.stop());
                send(ctx, &ServerMessage::Stopped { id, stopped });
            }
        }
    }
}

impl Actor for LiveQuerySocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.hb(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        for (_, handle) in self.queries.drain() {
            handle.stop();
        }
    }
}

impl StreamHandler<std::result::Result<ws::Message, ws::ProtocolError>> for LiveQuerySocket {
    fn handle(
        &mut self,
        msg: std::result::Result<ws::Message, ws::ProtocolError>,
        ctx: &mut Self::Context,
    ) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(client_msg) => self.handle_client_message(client_msg, ctx),
                Err(e) => send(
                    ctx,
                    &ServerMessage::Error {
                        id: None,
                        message: format!("Invalid message format: {e}"),
                    },
                ),
            },
            Ok(ws::Message::Binary(_)) => {
                warn!("Unexpected binary message");
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            _ => ctx.stop(),
        }
    }
}

impl Handler<Forward> for LiveQuerySocket {
    type Result = ();

    fn handle(&mut self, msg: Forward, ctx: &mut Self::Context) {
        if !self.queries.contains_key(&msg.id) {
            return;
        }
        let reply = match msg.event {
            SubscriptionEvent::Update { diff, rows } => ServerMessage::Update {
                id: msg.id,
                diff,
                rows: rows.as_ref().clone(),
            },
            SubscriptionEvent::Error(e) => ServerMessage::Error {
                id: Some(msg.id),
                message: e.to_string(),
            },
        };
        send(ctx, &reply);
    }
}
