use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const WORKERS: usize = 32;

/// A deliberately naive threaded HTTP server to practice against.
///
/// Each worker blocks until a full request has arrived, so a handful of
/// slow clients is enough to starve the pool and make probes go
/// unanswered. Run it and point the tester at http://127.0.0.1:8080/.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let port = std::env::args().nth(1).unwrap_or_else(|| "8080".into());
    let listener = TcpListener::bind(format!("127.0.0.1:{port}"))?;
    println!("Victim server listening on 127.0.0.1:{port} with {WORKERS} workers");

    let (tx, rx) = mpsc::channel::<TcpStream>();
    let rx = Arc::new(Mutex::new(rx));
    for _ in 0..WORKERS {
        let rx = Arc::clone(&rx);
        thread::spawn(move || loop {
            let stream = rx.lock().unwrap().recv();
            match stream {
                Ok(stream) => serve(stream),
                Err(_) => return,
            }
        });
    }

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => tx.send(stream)?,
            Err(e) => eprintln!("accept failed: {e}"),
        }
    }
    Ok(())
}

fn serve(mut stream: TcpStream) {
    // The worker is tied up until the request arrives in full.
    let _ = stream.set_read_timeout(Some(Duration::from_secs(300)));
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => return,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            Err(_) => return,
        }
    }

    // A large body keeps slow readers interesting as well.
    let body = "x".repeat(512 * 1024);
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes());
    let _ = stream.write_all(body.as_bytes());
}
