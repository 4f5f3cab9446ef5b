use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// TCP front end: one request per line in, one response per line out.
pub struct LineServer {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
}

impl LineServer {
    pub fn new(listener: TcpListener, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            listener,
            dispatcher,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let LineServer {
            listener,
            dispatcher,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("line server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => spawn_connection(stream, peer, &dispatcher),
                        Err(err) => warn!(error = ?err, "failed to accept connection"),
                    }
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn spawn_connection(stream: TcpStream, peer: SocketAddr, dispatcher: &Arc<Dispatcher>) {
    let dispatcher = Arc::clone(dispatcher);
    tokio::spawn(async move {
        debug!(peer = %peer, "connection opened");
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        match serve_lines(&dispatcher, &mut reader, &mut writer).await {
            Ok(requests) => debug!(peer = %peer, requests, "connection closed"),
            Err(err) => warn!(peer = %peer, error = ?err, "connection closed with error"),
        }
    });
}

/// Answers every non-blank line read from `reader` until EOF. Returns how
/// many requests were served.
pub async fn serve_lines<R, W>(dispatcher: &Dispatcher, reader: &mut R, writer: &mut W) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut served = 0;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(served);
        }
        let request = line.trim_end_matches(LINE_ENDINGS);
        if request.trim().is_empty() {
            continue;
        }

        let response = dispatcher.handle(request).await;
        debug!(request, %response, "answered request");
        let mut encoded = response.to_string().into_bytes();
        encoded.push(b'\n');
        writer.write_all(&encoded).await?;
        writer.flush().await?;
        served += 1;
    }
}
