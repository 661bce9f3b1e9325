//! End-to-end test: spawns the real `pandad` binary against a throwaway
//! config directory and drives its command protocol over a live TCP
//! connection, the way crosvm's own `e2e_tests`/`integration_tests` spawn
//! the real crosvm binary rather than calling library code directly.

use std::io::BufRead;
use std::io::BufReader;
use std::io::Write;
use std::net::TcpStream;
use std::process::Child;
use std::process::Command;
use std::process::Stdio;
use std::time::Duration;
use std::time::Instant;

struct Server {
    child: Child,
    port: u16,
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn find_free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

fn spawn_server(config_dir: &std::path::Path) -> Server {
    let port = find_free_port();
    let child = Command::new(env!("CARGO_BIN_EXE_pandad"))
        .arg("--config-dir")
        .arg(config_dir)
        .arg("--port")
        .arg(port.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn pandad");
    Server { child, port }
}

fn connect(port: u16) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)) {
            return stream;
        }
        if Instant::now() > deadline {
            panic!("pandad never started listening on port {port}");
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn send(stream: &mut TcpStream, line: &str) -> String {
    writeln!(stream, "{line}").unwrap();
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut response = String::new();
    reader.read_line(&mut response).unwrap();
    response
}

#[test]
fn param_field_write_then_read_over_the_wire() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("config"), "TTLIN 1\n    VAL param uint\n").unwrap();
    std::fs::write(dir.path().join("registers"), "*REG 0\nTTLIN 200\n    VAL 0\n").unwrap();

    let server = spawn_server(dir.path());
    let mut stream = connect(server.port);

    assert_eq!(send(&mut stream, "TTLIN.VAL=42"), "OK\n");
    assert_eq!(send(&mut stream, "TTLIN.VAL?"), "OK =42\n");
}

#[test]
fn unknown_block_reports_a_command_error_not_a_dropped_connection() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("config"), "TTLIN 1\n    VAL param uint\n").unwrap();
    std::fs::write(dir.path().join("registers"), "*REG 0\nTTLIN 200\n    VAL 0\n").unwrap();

    let server = spawn_server(dir.path());
    let mut stream = connect(server.port);

    let response = send(&mut stream, "NOSUCHBLOCK.VAL?");
    assert!(response.starts_with("ERR"), "expected an ERR response, got {response:?}");

    // the connection survives the error and keeps serving later commands.
    assert_eq!(send(&mut stream, "TTLIN.VAL=3"), "OK\n");
    assert_eq!(send(&mut stream, "TTLIN.VAL?"), "OK =3\n");
}
