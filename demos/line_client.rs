//! Interactive line client: type a line, get the server's reply.
//!
//! Run with: cargo run --example line_client -- 127.0.0.1:7878

use std::io::{self, BufRead, BufReader, Write};
use std::net::TcpStream;

fn main() -> io::Result<()> {
    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7878".to_string());

    let stream = TcpStream::connect(&addr)?;
    println!("connected to {addr}");

    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;

        let mut reply = String::new();
        if reader.read_line(&mut reply)? == 0 {
            println!("server closed the connection");
            break;
        }
        print!("> {reply}");
    }
    Ok(())
}
