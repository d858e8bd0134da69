use opdt::config::ServerConfig;
use opdt::packet::{self, RESPONSE_PACKET_SIZE};
use opdt::udp::{Client, Server};
use opdt::CancelToken;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

const PSK: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";

fn server_from_json() -> Server {
    let json = format!(r#"{{"listen": "127.0.0.1:0", "psk": "{}"}}"#, PSK);
    let config = ServerConfig::from_reader(json.as_bytes()).unwrap();
    let mut s = Server::from_config(&config).unwrap();
    s.start().unwrap();
    s
}

#[test]
fn test_discover_loopback() {
    let mut s = server_from_json();
    let server_addr = s.local_addr().unwrap();

    let c = Client::new(server_addr, "127.0.0.1:0", &[0u8; 32]).unwrap();
    let addr = c
        .get(&CancelToken::new(), Duration::from_millis(50), 3)
        .unwrap();
    assert_eq!(addr, c.local_addr().unwrap());

    c.close();
    s.stop().unwrap();
}

#[test]
fn test_wrong_psk_gets_no_answer() {
    let mut s = server_from_json();
    let server_addr = s.local_addr().unwrap();

    let c = Client::new(server_addr, "127.0.0.1:0", &[1u8; 32]).unwrap();
    assert!(c
        .get(&CancelToken::new(), Duration::from_millis(20), 2)
        .is_err());

    s.stop().unwrap();
}

#[test]
fn test_raw_exchange() {
    let mut s = server_from_json();
    let server_addr = s.local_addr().unwrap();
    let codec = packet::Client::new(&[0u8; 32]).unwrap();

    let sk = UdpSocket::bind("127.0.0.1:0").unwrap();
    sk.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    let mut req = [0u8; packet::REQUEST_PACKET_SIZE];
    codec.put_request(&mut req);
    sk.send_to(&req, server_addr).unwrap();

    let mut buf = [0u8; 256];
    let (n, _) = sk.recv_from(&mut buf).unwrap();
    assert_eq!(n, RESPONSE_PACKET_SIZE);
    let observed: SocketAddr = codec.parse_response(&buf[..n]).unwrap();
    assert_eq!(observed, sk.local_addr().unwrap());

    s.stop().unwrap();
}
