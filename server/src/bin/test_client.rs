use clap::Parser;
use shared::{try_decode_message, NetMessage, OrderListMessage, OrderMessage};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, Duration};

/// Scripted peer: takes a seat, sends a few order batches and then waits for
/// the server to close the connection.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server address
    #[clap(short, long, default_value = "127.0.0.1:4321")]
    server: String,
    /// Number of order batches to send
    #[clap(short, long, default_value = "5")]
    batches: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    println!("Connecting to {}", args.server);
    let mut stream = TcpStream::connect(&args.server).await?;
    let mut inbound = Vec::new();
    let mut buf = [0u8; 2048];

    for batch in 0..args.batches {
        let order = OrderMessage::new(&[batch, batch + 1, batch + 2], batch as i32 * 10, -5)?;

        // Split the order across writes to exercise server-side reassembly
        let bytes = NetMessage::Order(order).to_bytes()?;
        let (head, tail) = bytes.split_at(bytes.len() / 2);

        stream
            .write_all(&NetMessage::OrderList(OrderListMessage::default()).to_bytes()?)
            .await?;
        stream.write_all(head).await?;
        sleep(Duration::from_millis(50)).await;
        stream.write_all(tail).await?;
        stream
            .write_all(&NetMessage::OrderList(OrderListMessage::default()).to_bytes()?)
            .await?;
        stream.write_all(&NetMessage::Reply.to_bytes()?).await?;
        println!("Sent batch {}", batch);

        sleep(Duration::from_millis(500)).await;
    }

    println!("Waiting for server to close the connection (Ctrl+C the server)");
    loop {
        let len = stream.read(&mut buf).await?;
        if len == 0 {
            break;
        }
        inbound.extend_from_slice(&buf[..len]);

        while let Some((message, consumed)) = try_decode_message(&inbound)? {
            println!("Received: {:?}", message);
            inbound.drain(..consumed);
        }
    }

    println!("Server closed the connection");
    Ok(())
}
