use std::net::SocketAddr;

use anyhow::{Context, Result, bail};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
};
use tracing::info;

use crate::cli::SendArgs;

pub async fn run(args: SendArgs) -> Result<()> {
    let responses = send(args.server, &args.requests).await?;
    for response in responses {
        println!("{response}");
    }
    Ok(())
}

/// Sends each request on one connection and collects the matching replies.
pub async fn send<S>(server: SocketAddr, requests: &[S]) -> Result<Vec<String>>
where
    S: AsRef<str>,
{
    let stream = TcpStream::connect(server)
        .await
        .with_context(|| format!("failed to connect to {server}"))?;
    info!("connected to {}", server);

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut responses = Vec::with_capacity(requests.len());
    let mut line = String::new();

    for request in requests {
        let request = request.as_ref().trim();
        if request.is_empty() {
            continue;
        }
        writer.write_all(request.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            bail!("server closed the connection before answering `{request}`");
        }
        responses.push(line.trim_end().to_string());
    }

    Ok(responses)
}
