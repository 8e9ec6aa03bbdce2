//! Loopback integration: two endpoints over real UDP sockets on 127.0.0.1,
//! exercising the blocking API end to end.

use bytes::Bytes;
use quiver::{Config, Endpoint, Event};
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

fn server_config() -> Config {
    Config {
        num_bufs: 64,
        ..Config::default()
    }
}

fn spawn_echo_server(cfg: Config) -> (SocketAddr, thread::JoinHandle<()>) {
    let mut server = Endpoint::server(cfg, "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = server.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let Ok(Some(conn)) = server.accept(Some(Duration::from_secs(5))) else {
            return;
        };
        // Serve exactly one request then quiesce.
        loop {
            match server.ready(Some(Duration::from_secs(5))) {
                Ok(Some((h, Event::StreamReadable(id)))) if h == conn => {
                    let mut request = Vec::new();
                    loop {
                        match server.read_stream(h, id, 4096, Some(Duration::from_secs(2))) {
                            Ok(Some((data, fin))) => {
                                request.extend_from_slice(&data);
                                if fin {
                                    break;
                                }
                            }
                            _ => return,
                        }
                    }
                    let response = [b"echo: ", request.as_slice()].concat();
                    server
                        .stream_write(h, id, Bytes::from(response), true)
                        .unwrap();
                    // Keep the loop alive until the client acks everything.
                    for _ in 0..50 {
                        let _ = server.ready(Some(Duration::from_millis(20)));
                    }
                    return;
                }
                Ok(Some(_)) => continue,
                _ => return,
            }
        }
    });
    (addr, handle)
}

#[test]
fn connect_request_response() {
    let (addr, server_thread) = spawn_echo_server(server_config());

    let mut client = Endpoint::client(server_config()).unwrap();
    let conn = client.connect(addr, Duration::from_secs(5)).unwrap();

    let stream = client.open_stream(conn, true).unwrap();
    client
        .stream_write(conn, stream, Bytes::from_static(b"ping"), true)
        .unwrap();

    let mut response = Vec::new();
    loop {
        match client
            .read_stream(conn, stream, 4096, Some(Duration::from_secs(5)))
            .unwrap()
        {
            Some((data, fin)) => {
                response.extend_from_slice(&data);
                if fin {
                    break;
                }
            }
            None => panic!("read timed out"),
        }
    }
    assert_eq!(response, b"echo: ping");

    client.close(conn, 0, "done").unwrap();
    server_thread.join().unwrap();
}

#[test]
fn accept_times_out_quietly() {
    let mut server = Endpoint::server(server_config(), "127.0.0.1:0".parse().unwrap()).unwrap();
    let accepted = server.accept(Some(Duration::from_millis(50))).unwrap();
    assert!(accepted.is_none());
}

#[test]
fn connect_to_dead_port_times_out() {
    let mut client = Endpoint::client(server_config()).unwrap();
    // A bound-but-silent socket: nothing will ever answer.
    let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let result = client.connect(silent.local_addr().unwrap(), Duration::from_millis(200));
    assert!(result.is_err());
}

#[test]
fn retry_path_still_connects() {
    let cfg = Config {
        force_retry: true,
        ..server_config()
    };
    let (addr, server_thread) = spawn_echo_server(cfg);

    let mut client = Endpoint::client(server_config()).unwrap();
    let conn = client.connect(addr, Duration::from_secs(5)).unwrap();
    let stream = client.open_stream(conn, true).unwrap();
    client
        .stream_write(conn, stream, Bytes::from_static(b"tokened"), true)
        .unwrap();
    let (data, _) = client
        .read_stream(conn, stream, 4096, Some(Duration::from_secs(5)))
        .unwrap()
        .expect("response after retry");
    assert!(data.starts_with(b"echo: "));
    client.close(conn, 0, "done").unwrap();
    server_thread.join().unwrap();
}
