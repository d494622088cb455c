//! Loopback demo: a client engine and a server engine exchanging a full
//! request/response cycle through in-memory buffers, printing the events
//! each side observes. Run with `cargo run --example loopback`.

use weft_h2::{H2Connection, H2Event, HeaderField, Settings};

fn shuttle(from: &mut H2Connection, to: &mut H2Connection) {
    let bytes = from.take_pending_send();
    if !bytes.is_empty() {
        println!("  [wire] {} bytes", bytes.len());
        to.recv(&bytes).expect("peer rejected frames");
    }
}

fn report(name: &str, conn: &mut H2Connection) {
    while let Some(event) = conn.poll_event() {
        match event {
            H2Event::FrameSent(_) | H2Event::FrameReceived(_) => {}
            H2Event::Headers {
                stream_id, headers, ..
            } => {
                let pretty: Vec<String> = headers
                    .iter()
                    .map(|h| {
                        format!(
                            "{}: {}",
                            String::from_utf8_lossy(&h.name),
                            String::from_utf8_lossy(&h.value)
                        )
                    })
                    .collect();
                println!("{name}: headers on {stream_id} [{}]", pretty.join(", "));
            }
            H2Event::Data {
                stream_id, data, ..
            } => {
                println!(
                    "{name}: {} bytes of data on {stream_id}: {:?}",
                    data.len(),
                    String::from_utf8_lossy(&data)
                );
            }
            other => println!("{name}: {other:?}"),
        }
    }
}

fn main() {
    let mut client = H2Connection::client(Settings::default());
    let mut server = H2Connection::server(Settings {
        max_concurrent_streams: Some(100),
        ..Default::default()
    });

    println!("-- handshake --");
    shuttle(&mut client, &mut server);
    shuttle(&mut server, &mut client);
    report("client", &mut client);
    report("server", &mut server);

    println!("-- request --");
    let stream_id = client.new_stream(None).expect("stream id");
    client
        .send_headers(
            stream_id,
            &[
                HeaderField::new(b":method", b"GET"),
                HeaderField::new(b":path", b"/"),
                HeaderField::new(b":scheme", b"http"),
            ],
            true,
        )
        .expect("send request");
    shuttle(&mut client, &mut server);
    report("server", &mut server);

    println!("-- response --");
    server
        .send_headers(stream_id, &[HeaderField::new(b":status", b"200")], false)
        .expect("send response headers");
    server
        .send_data(stream_id, b"hello over h2", true)
        .expect("send response body");
    shuttle(&mut server, &mut client);
    report("client", &mut client);

    println!(
        "done: client active={} server active={}",
        client.active_stream_count(),
        server.active_stream_count()
    );
}
