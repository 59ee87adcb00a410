//! Dedicated LISTEN connection.
//!
//! The listen connection is opened outside the pool and lives as long as
//! the engine. Its driver task forwards every notification payload on the
//! engine's channel to an unbounded queue; the engine's notice pump
//! consumes that queue.

use crate::error::{LiveError, Result};
use crate::sql;
use futures_util::stream;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tokio_postgres::{AsyncMessage, Client, NoTls};

pub struct NoticeListener {
    client: Client,
    channel: String,
    driver: JoinHandle<()>,
}

impl NoticeListener {
    /// Connect, start the driver and issue `LISTEN`. The returned receiver
    /// yields raw notice parts and closes when the connection ends.
    pub async fn connect(
        connection_string: &str,
        channel: &str,
    ) -> Result<(Self, UnboundedReceiver<String>)> {
        let (client, mut connection) = tokio_postgres::connect(connection_string, NoTls)
            .await
            .map_err(|e| LiveError::Connection(format!("listen connection failed: {e}")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let wanted = channel.to_string();
        let driver = tokio::spawn(async move {
            let mut messages = stream::poll_fn(move |cx| connection.poll_message(cx));
            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notification(n)) if n.channel() == wanted => {
                        if tx.send(n.payload().to_string()).is_err() {
                            debug!("notice receiver dropped, stopping listener");
                            break;
                        }
                    }
                    Ok(AsyncMessage::Notice(notice)) => {
                        debug!("server notice on listen connection: {}", notice.message());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("listen connection failed: {e}");
                        break;
                    }
                }
            }
            info!("listen connection closed");
        });

        client
            .batch_execute(&sql::listen(channel))
            .await
            .map_err(|e| LiveError::Connection(format!("LISTEN failed: {e}")))?;
        info!("listening on channel {channel}");

        Ok((
            NoticeListener {
                client,
                channel: channel.to_string(),
                driver,
            },
            rx,
        ))
    }

    /// Issue `UNLISTEN` and close the connection.
    pub async fn close(self) {
        if let Err(e) = self.client.batch_execute(&sql::unlisten(&self.channel)).await {
            warn!("UNLISTEN {} failed: {e}", self.channel);
        }
        drop(self.client);
        if let Err(e) = self.driver.await {
            warn!("listen driver ended abnormally: {e}");
        }
    }
}
