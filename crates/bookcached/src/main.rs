//! BookCache Daemon - line-oriented TCP front end for bookcache

mod handler;
mod protocol;

use anyhow::Result;
use bookcache::Cache;
use bytes::BytesMut;
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::handler::{CommandHandler, MAX_MEMORY};
use crate::protocol::{Request, Response};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Bind host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Bind port
    #[arg(short = 't', long, default_value_t = 33052)]
    port: u16,

    /// Memory budget in bytes (keys + values)
    #[arg(
        short,
        long,
        default_value_t = 1 << 30,
        value_parser = clap::value_parser!(u64).range(1..=MAX_MEMORY)
    )]
    maxmem: u64,

    /// Health check mode (for Docker)
    #[arg(long)]
    health: bool,
}

impl Args {
    fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    let bind = args.bind();

    // Health check
    if args.health {
        match TcpStream::connect(&bind).await {
            Ok(_) => {
                println!("OK");
                std::process::exit(0);
            }
            Err(_) => {
                eprintln!("FAILED");
                std::process::exit(1);
            }
        }
    }

    info!("Starting BookCache Daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("Memory budget: {} bytes", args.maxmem);

    let handler = CommandHandler::new(Cache::new(usize::try_from(args.maxmem)?)?);

    let listener = TcpListener::bind(&bind).await?;
    info!("Server listening on {}", bind);

    serve(listener, handler).await;
    info!("Server stopped");
    Ok(())
}

/// Accept connections until `POST /shutdown` or Ctrl+C
async fn serve(listener: TcpListener, handler: CommandHandler) {
    let mut shutdown = handler.shutdown_signal();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("New connection from {}", addr);
                    let handler = handler.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, handler).await {
                            error!("Error handling client {}: {}", addr, e);
                        }
                        debug!("Connection closed: {}", addr);
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                }
            },
            _ = wait_for_shutdown(&mut shutdown) => {
                info!("Shutting down");
                return;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                return;
            }
        }
    }
}

async fn wait_for_shutdown(signal: &mut watch::Receiver<bool>) {
    while !*signal.borrow() {
        if signal.changed().await.is_err() {
            // Sender gone; nobody can ask for shutdown any more
            std::future::pending::<()>().await;
        }
    }
}

async fn handle_client(mut stream: TcpStream, handler: CommandHandler) -> Result<()> {
    let mut buffer = BytesMut::with_capacity(4096);

    loop {
        let n = stream.read_buf(&mut buffer).await?;

        if n == 0 {
            return Ok(());
        }

        loop {
            match Request::parse(&mut buffer) {
                Ok(Some(request)) => {
                    debug!("{:?}", request);
                    let response = handler.handle(request);
                    stream.write_all(&response.serialize()).await?;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Parse error: {}", e);
                    stream.write_all(&Response::from(&e).serialize()).await?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[test]
    fn test_args() {
        Args::command().debug_assert();

        let args = Args::parse_from(["bookcached"]);
        assert_eq!(args.bind(), "127.0.0.1:33052");
        assert_eq!(args.maxmem, 1 << 30);

        let args = Args::parse_from(["bookcached", "-t", "4000", "-m", "64"]);
        assert_eq!(args.port, 4000);
        assert_eq!(args.maxmem, 64);

        assert!(Args::try_parse_from(["bookcached", "-m", "0"]).is_err());
        assert!(Args::try_parse_from(["bookcached", "-m", "2147483648"]).is_err());
    }

    /// Read one response; returns (status line, body)
    async fn read_response<R: tokio::io::AsyncBufRead + Unpin>(reader: &mut R) -> (String, String) {
        let mut status = String::new();
        reader.read_line(&mut status).await.unwrap();
        let mut header = String::new();
        reader.read_line(&mut header).await.unwrap();
        let len: usize = header
            .trim()
            .strip_prefix("Content-Length: ")
            .unwrap()
            .parse()
            .unwrap();
        let mut blank = String::new();
        reader.read_line(&mut blank).await.unwrap();
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await.unwrap();
        (status.trim_end().to_string(), String::from_utf8(body).unwrap())
    }

    #[tokio::test]
    async fn test_serve_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handler = CommandHandler::new(Cache::new(32).unwrap());
        let server = tokio::spawn(serve(listener, handler));

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);

        write
            .write_all(b"PUT /key/ab/1234\nGET /key/ab HTTP/1.1\r\nGET /memsize\n")
            .await
            .unwrap();
        assert_eq!(read_response(&mut reader).await.0, "HTTP/1.1 201 Created");
        assert_eq!(
            read_response(&mut reader).await,
            (
                "HTTP/1.1 200 OK".to_string(),
                r#"{"key":"ab","value":"1234"}"#.to_string()
            )
        );
        assert_eq!(
            read_response(&mut reader).await.1,
            r#"{"memused":6}"#.to_string()
        );

        // Evicts "ab"
        write
            .write_all(b"PUT /key/cd/12345678901234567890123456\nHEAD /key/ab\nBOGUS\n")
            .await
            .unwrap();
        assert_eq!(read_response(&mut reader).await.0, "HTTP/1.1 201 Created");
        assert_eq!(read_response(&mut reader).await.0, "HTTP/1.1 404 Not Found");
        assert_eq!(read_response(&mut reader).await.0, "HTTP/1.1 400 Bad Request");

        write.write_all(b"POST /memsize/64\nPOST /shutdown\n").await.unwrap();
        assert_eq!(
            read_response(&mut reader).await.0,
            "HTTP/1.1 405 Method Not Allowed"
        );
        assert_eq!(read_response(&mut reader).await.0, "HTTP/1.1 200 OK");

        server.await.unwrap();
    }
}
