//! Session-level behavior: flow control, pings, go-away, backlog limits,
//! protocol violations, and shutdown semantics.

use std::sync::OnceLock;
use std::time::Duration;

use testresult::TestResult;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _, DuplexStream};
use tokio::time::{sleep, timeout};
use tokio_util::compat::TokioAsyncReadCompatExt;

use braid::frame::{Flags, FrameType, GoAwayCode, Header};
use braid::{Config, Error, Session, Stream};

static TRACING: OnceLock<()> = OnceLock::new();

fn init_tracing() {
    TRACING.get_or_init(|| {
        tracing_subscriber::fmt().with_env_filter("warn").init();
    });
}

fn test_config() -> Config {
    Config {
        enable_keepalive: false,
        ..Config::default()
    }
}

fn pair(client_config: Config, server_config: Config) -> (Session, Session) {
    let (client_end, server_end) = tokio::io::duplex(64 * 1024);
    let (client, client_driver) =
        Session::client(client_end.compat(), client_config).expect("client config");
    let (server, server_driver) =
        Session::server(server_end.compat(), server_config).expect("server config");
    tokio::spawn(client_driver);
    tokio::spawn(server_driver);
    (client, server)
}

/// A server session wired to a raw pipe end the test drives by hand.
fn session_with_raw_peer(config: Config) -> (Session, DuplexStream) {
    let (session_end, raw) = tokio::io::duplex(64 * 1024);
    let (session, driver) = Session::server(session_end.compat(), config).expect("config");
    tokio::spawn(driver);
    (session, raw)
}

async fn read_full(stream: &Stream, buf: &mut [u8]) -> TestResult {
    let mut read = 0;
    while read < buf.len() {
        let n = stream.read(&mut buf[read..]).await?;
        assert_ne!(n, 0, "unexpected end of stream");
        read += n;
    }
    Ok(())
}

async fn wait_until_closed(session: &Session) {
    for _ in 0..250 {
        if session.is_closed() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("session did not close in time");
}

#[tokio::test]
async fn write_blocks_on_empty_window_and_resumes_on_credit() -> TestResult {
    init_tracing();
    // A 4 KiB window on both sides; the window size is part of the wire
    // contract so the peers must agree.
    let config = Config {
        max_stream_window_size: 4096,
        ..test_config()
    };
    let (client, server) = pair(config.clone(), config);

    let outbound = client.open().await?;
    let inbound = server.accept().await?;

    let payload = vec![0xA5u8; 6144];

    // The first write consumes the whole window.
    let n = outbound.write(&payload).await?;
    assert_eq!(n, 4096);

    // With zero credit the next write parks.
    let blocked = timeout(Duration::from_millis(200), outbound.write(&payload[n..])).await;
    assert!(blocked.is_err(), "write should block while the window is empty");

    // Consuming 3 KiB re-advertises at least half a window.
    let mut buf = vec![0u8; 3072];
    read_full(&inbound, &mut buf).await?;
    assert!(buf.iter().all(|&b| b == 0xA5));

    let granted = timeout(Duration::from_secs(5), outbound.write(&payload[n..])).await??;
    assert_eq!(granted, 2048);

    Ok(())
}

#[tokio::test]
async fn ping_round_trip_needs_no_user_on_the_other_side() -> TestResult {
    init_tracing();
    let (client, server) = pair(test_config(), test_config());

    let rtt = client.ping().await?;
    assert!(rtt < Duration::from_secs(5));

    // Symmetric: the server can probe too.
    server.ping().await?;
    Ok(())
}

#[tokio::test]
async fn go_away_refuses_new_streams_but_keeps_existing_ones() -> TestResult {
    init_tracing();
    let (client, server) = pair(test_config(), test_config());

    let outbound = client.open().await?;
    let inbound = server.accept().await?;

    server.go_away().await;

    // The refusal is observed once the go-away frame arrives.
    let mut refused = false;
    for _ in 0..100 {
        match client.open().await {
            Err(Error::RemoteGoAway) => {
                refused = true;
                break;
            }
            // Raced ahead of the go-away frame; the server resets it.
            Ok(_stale) => sleep(Duration::from_millis(10)).await,
            Err(err) => return Err(err.into()),
        }
    }
    assert!(refused, "open should fail with RemoteGoAway");

    // Established streams keep transferring.
    outbound.write_all(b"still here").await?;
    let mut buf = [0u8; 10];
    read_full(&inbound, &mut buf).await?;
    assert_eq!(&buf, b"still here");

    assert!(!client.is_closed());
    assert!(!server.is_closed());
    Ok(())
}

#[tokio::test]
async fn backlog_overflow_resets_the_excess_stream() -> TestResult {
    init_tracing();
    let server_config = Config {
        accept_backlog: 1,
        ..test_config()
    };
    let (client, server) = pair(test_config(), server_config);

    let first = client.open().await?;
    let second = client.open().await?;

    // The second SYN finds the accept queue full and is reset.
    let mut buf = [0u8; 1];
    let err = timeout(Duration::from_secs(5), second.read(&mut buf))
        .await?
        .expect_err("second stream should be reset");
    assert!(matches!(err, Error::ConnectionReset));

    // The first stream was queued and works once accepted.
    let inbound = server.accept().await?;
    assert_eq!(inbound.id(), first.id());
    first.write_all(b"ok").await?;
    let mut buf = [0u8; 2];
    read_full(&inbound, &mut buf).await?;
    assert_eq!(&buf, b"ok");

    Ok(())
}

#[tokio::test]
async fn frame_for_unknown_stream_is_a_protocol_violation() -> TestResult {
    init_tracing();
    let (session, mut raw) = session_with_raw_peer(test_config());

    // A data frame without SYN for an id the session never saw.
    raw.write_all(&Header::data(Flags::default(), 9, 0).encode())
        .await?;

    wait_until_closed(&session).await;
    assert!(matches!(
        session.shutdown_cause().await,
        Some(Error::MissingStream(9))
    ));
    assert!(matches!(session.open().await, Err(Error::SessionShutdown)));
    assert!(matches!(session.ping().await, Err(Error::SessionShutdown)));
    Ok(())
}

#[tokio::test]
async fn syn_with_local_parity_is_a_protocol_violation() -> TestResult {
    init_tracing();
    // We are the server; an incoming SYN with an even (server-side) id is
    // something the peer may not originate.
    let (session, mut raw) = session_with_raw_peer(test_config());

    raw.write_all(&Header::window_update(Flags::SYN, 4, 0).encode())
        .await?;

    wait_until_closed(&session).await;
    assert!(matches!(
        session.shutdown_cause().await,
        Some(Error::InvalidStreamId(4))
    ));
    Ok(())
}

#[tokio::test]
async fn duplicate_syn_is_a_protocol_violation() -> TestResult {
    init_tracing();
    let (session, mut raw) = session_with_raw_peer(test_config());

    raw.write_all(&Header::window_update(Flags::SYN, 9, 0).encode())
        .await?;
    raw.write_all(&Header::window_update(Flags::SYN, 9, 0).encode())
        .await?;

    wait_until_closed(&session).await;
    assert!(matches!(
        session.shutdown_cause().await,
        Some(Error::DuplicateStream(9))
    ));
    Ok(())
}

#[tokio::test]
async fn unknown_version_kills_the_session() -> TestResult {
    init_tracing();
    let (session, mut raw) = session_with_raw_peer(test_config());

    let mut wire = Header::ping(Flags::SYN, 0).encode();
    wire[0] = 1;
    raw.write_all(&wire).await?;

    wait_until_closed(&session).await;
    assert!(matches!(
        session.shutdown_cause().await,
        Some(Error::InvalidVersion(1))
    ));
    Ok(())
}

#[tokio::test]
async fn data_beyond_the_advertised_window_kills_the_session() -> TestResult {
    init_tracing();
    let (session, mut raw) = session_with_raw_peer(test_config());

    // Claims more body than the default 256 KiB window permits. The length
    // check fires before any body byte is read, so none are sent.
    raw.write_all(&Header::data(Flags::SYN, 9, 300_000).encode())
        .await?;

    wait_until_closed(&session).await;
    assert!(matches!(
        session.shutdown_cause().await,
        Some(Error::RecvWindowExceeded(9))
    ));
    Ok(())
}

#[tokio::test]
async fn go_away_with_error_code_kills_the_session() -> TestResult {
    init_tracing();
    let (session, mut raw) = session_with_raw_peer(test_config());

    raw.write_all(&Header::go_away(GoAwayCode::ProtocolError).encode())
        .await?;

    wait_until_closed(&session).await;
    assert!(matches!(
        session.shutdown_cause().await,
        Some(Error::RemoteProtocolError)
    ));
    Ok(())
}

#[tokio::test]
async fn close_is_idempotent_and_fails_everything() -> TestResult {
    init_tracing();
    let (client, server) = pair(test_config(), test_config());

    let outbound = client.open().await?;
    let inbound = server.accept().await?;

    client.close().await;
    client.close().await;
    assert!(client.is_closed());

    assert!(matches!(client.open().await, Err(Error::SessionShutdown)));
    assert!(matches!(client.accept().await, Err(Error::SessionShutdown)));
    assert!(matches!(client.ping().await, Err(Error::SessionShutdown)));

    let mut buf = [0u8; 4];
    assert!(matches!(
        outbound.read(&mut buf).await,
        Err(Error::SessionShutdown)
    ));
    assert!(matches!(
        outbound.write(b"x").await,
        Err(Error::SessionShutdown)
    ));

    // Dropping the transport takes the other side down with a transport
    // error, failing its streams too.
    wait_until_closed(&server).await;
    assert!(matches!(
        server.shutdown_cause().await,
        Some(Error::Transport(_))
    ));
    assert!(matches!(
        inbound.read(&mut buf).await,
        Err(Error::SessionShutdown)
    ));
    Ok(())
}

#[tokio::test]
async fn shutdown_unblocks_a_pending_ping() -> TestResult {
    init_tracing();
    // The raw peer never answers, so the ping can only end via shutdown.
    let (session, _raw) = session_with_raw_peer(test_config());

    let pinger = session.clone();
    let pending = tokio::spawn(async move { pinger.ping().await });

    sleep(Duration::from_millis(50)).await;
    session.close().await;

    let result = timeout(Duration::from_secs(5), pending).await??;
    assert!(matches!(result, Err(Error::SessionShutdown)));
    Ok(())
}

#[tokio::test]
async fn reset_fails_both_ends_of_the_stream() -> TestResult {
    init_tracing();
    let (client, server) = pair(test_config(), test_config());

    let outbound = client.open().await?;
    let inbound = server.accept().await?;

    // Park a reader on the server side, then reset from the client.
    let reader = inbound.clone();
    let parked = tokio::spawn(async move {
        let mut buf = [0u8; 4];
        reader.read(&mut buf).await
    });
    sleep(Duration::from_millis(50)).await;

    outbound.reset().await?;

    let result = timeout(Duration::from_secs(5), parked).await??;
    assert!(matches!(result, Err(Error::ConnectionReset)));

    let mut buf = [0u8; 4];
    assert!(matches!(
        outbound.read(&mut buf).await,
        Err(Error::ConnectionReset)
    ));
    Ok(())
}

#[tokio::test]
async fn keepalive_pings_show_up_on_the_wire() -> TestResult {
    init_tracing();
    let config = Config {
        enable_keepalive: true,
        keepalive_interval: Duration::from_millis(50),
        ..Config::default()
    };
    let (session, mut raw) = session_with_raw_peer(config);

    let mut header_buf = [0u8; 12];
    timeout(Duration::from_secs(2), raw.read_exact(&mut header_buf)).await??;
    let header = Header::decode(&header_buf)?;
    assert_eq!(header.frame_type(), FrameType::Ping);
    assert!(header.flags().contains(Flags::SYN));

    // Answer it; the session stays healthy and keeps probing.
    raw.write_all(&Header::ping(Flags::ACK, header.length()).encode())
        .await?;
    sleep(Duration::from_millis(120)).await;
    assert!(!session.is_closed());

    Ok(())
}
