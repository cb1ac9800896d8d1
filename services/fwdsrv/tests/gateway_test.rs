//! End-to-end gateway tests against in-process Modbus-TCP slaves

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

mod support;

use std::time::{Duration, Instant};

use errors::ServiceError;
use fwdsrv::{Gateway, GatewayConfig, ServerSpec};
use support::{start_gateway, StubSlave, TestClient};
use tokio::io::AsyncReadExt;

#[tokio::test]
async fn test_read_holding_registers_forwarded() {
    let slave = StubSlave::start().await;
    {
        let mut bank = slave.bank.lock();
        bank.holding[0] = 0x0001;
        bank.holding[1] = 0x00FF;
    }
    let gateway = start_gateway(vec![slave.spec(3)]).await;

    let mut client = TestClient::connect(gateway.local_addr()).await;
    let reply = client.request(3, &[0x03, 0x00, 0x00, 0x00, 0x02]).await;
    assert_eq!(reply, vec![0x03, 0x04, 0x00, 0x01, 0x00, 0xFF]);

    gateway.stop().await;
}

#[tokio::test]
async fn test_all_function_codes() {
    let slave = StubSlave::start().await;
    let gateway = start_gateway(vec![slave.spec(1)]).await;
    let mut client = TestClient::connect(gateway.local_addr()).await;

    // FC06 then FC03
    assert_eq!(
        client.request(1, &[0x06, 0x00, 0x0A, 0x12, 0x34]).await,
        vec![0x06, 0x00, 0x0A, 0x12, 0x34]
    );
    assert_eq!(
        client.request(1, &[0x03, 0x00, 0x0A, 0x00, 0x01]).await,
        vec![0x03, 0x02, 0x12, 0x34]
    );

    // FC05 then FC01
    assert_eq!(
        client.request(1, &[0x05, 0x00, 0x02, 0xFF, 0x00]).await,
        vec![0x05, 0x00, 0x02, 0xFF, 0x00]
    );
    assert_eq!(
        client.request(1, &[0x01, 0x00, 0x00, 0x00, 0x04]).await,
        vec![0x01, 0x01, 0b0000_0100]
    );

    // FC15 then FC01
    assert_eq!(
        client
            .request(1, &[0x0F, 0x00, 0x10, 0x00, 0x0A, 0x02, 0xCD, 0x01])
            .await,
        vec![0x0F, 0x00, 0x10, 0x00, 0x0A]
    );
    assert_eq!(
        client.request(1, &[0x01, 0x00, 0x10, 0x00, 0x0A]).await,
        vec![0x01, 0x02, 0xCD, 0x01]
    );

    // FC02: stub reports even addresses as ON
    assert_eq!(
        client.request(1, &[0x02, 0x00, 0x00, 0x00, 0x08]).await,
        vec![0x02, 0x01, 0x55]
    );

    // FC04: stub input register n holds n
    assert_eq!(
        client.request(1, &[0x04, 0x01, 0x00, 0x00, 0x02]).await,
        vec![0x04, 0x04, 0x01, 0x00, 0x01, 0x01]
    );

    // FC16 then FC03
    assert_eq!(
        client
            .request(1, &[0x10, 0x00, 0x20, 0x00, 0x02, 0x04, 0xAB, 0xCD, 0x00, 0x07])
            .await,
        vec![0x10, 0x00, 0x20, 0x00, 0x02]
    );
    assert_eq!(
        client.request(1, &[0x03, 0x00, 0x20, 0x00, 0x02]).await,
        vec![0x03, 0x04, 0xAB, 0xCD, 0x00, 0x07]
    );

    gateway.stop().await;
}

#[tokio::test]
async fn test_write_multiple_registers_response_is_fixed_length() {
    let slave = StubSlave::start().await;
    let gateway = start_gateway(vec![slave.spec(1)]).await;
    let mut client = TestClient::connect(gateway.local_addr()).await;

    for quantity in [1u16, 7, 123] {
        let mut pdu = vec![0x10, 0x00, 0x00];
        pdu.extend_from_slice(&quantity.to_be_bytes());
        pdu.push((quantity * 2) as u8);
        for i in 0..quantity {
            pdu.extend_from_slice(&i.to_be_bytes());
        }

        let reply = client.request(1, &pdu).await;
        let mut expected = vec![0x10, 0x00, 0x00];
        expected.extend_from_slice(&quantity.to_be_bytes());
        assert_eq!(reply, expected, "quantity {}", quantity);
    }

    gateway.stop().await;
}

#[tokio::test]
async fn test_write_multiple_coils_response_is_fixed_length() {
    let slave = StubSlave::start().await;
    let gateway = start_gateway(vec![slave.spec(1)]).await;
    let mut client = TestClient::connect(gateway.local_addr()).await;

    for quantity in [1u16, 7, 123] {
        let byte_count = quantity.div_ceil(8);
        let mut pdu = vec![0x0F, 0x00, 0x40];
        pdu.extend_from_slice(&quantity.to_be_bytes());
        pdu.push(byte_count as u8);
        // Every coil on, unused high bits of the last byte clear
        for i in 0..byte_count {
            let bits = (quantity - i * 8).min(8);
            pdu.push((0xFFu16 >> (8 - bits)) as u8);
        }

        let reply = client.request(1, &pdu).await;
        let mut expected = vec![0x0F, 0x00, 0x40];
        expected.extend_from_slice(&quantity.to_be_bytes());
        assert_eq!(reply, expected, "quantity {}", quantity);
    }
    assert!(slave.bank.lock().coils[0x40..0x40 + 123].iter().all(|&c| c));

    gateway.stop().await;
}

#[tokio::test]
async fn test_exception_codes() {
    let slave = StubSlave::start().await;
    let gateway = start_gateway(vec![slave.spec(1)]).await;
    let mut client = TestClient::connect(gateway.local_addr()).await;

    // Unknown slave
    assert_eq!(
        client.request(99, &[0x03, 0x00, 0x00, 0x00, 0x01]).await,
        vec![0x83, 0x02]
    );
    // Unsupported function
    assert_eq!(
        client.request(1, &[0x2B, 0x0E, 0x01, 0x00]).await,
        vec![0xAB, 0x01]
    );
    // Undersized PDU
    assert_eq!(client.request(1, &[0x03, 0x00, 0x00]).await, vec![0x83, 0x02]);
    // Invalid coil value
    assert_eq!(
        client.request(1, &[0x05, 0x00, 0x01, 0x12, 0x34]).await,
        vec![0x85, 0x03]
    );
    // Quantity above the read cap
    assert_eq!(
        client.request(1, &[0x03, 0x00, 0x00, 0x00, 0x7E]).await,
        vec![0x83, 0x03]
    );
    // Backend-reported exception (address outside the stub bank)
    assert_eq!(
        client.request(1, &[0x03, 0xFF, 0x00, 0x00, 0x10]).await,
        vec![0x83, 0x04]
    );

    // The connection survives every failure above
    assert_eq!(
        client.request(1, &[0x06, 0x00, 0x01, 0x00, 0x01]).await,
        vec![0x06, 0x00, 0x01, 0x00, 0x01]
    );
    // Rejected requests never reached the backend
    assert_eq!(slave.requests.load(std::sync::atomic::Ordering::SeqCst), 2);

    gateway.stop().await;
}

#[tokio::test]
async fn test_timeout_isolated_to_slow_slave() {
    let slow = StubSlave::start().await;
    let fast = StubSlave::start().await;
    slow.set_delay(Duration::from_millis(600));

    let gateway = start_gateway(vec![
        slow.spec(1).with_timeout(Duration::from_millis(200)),
        fast.spec(2),
    ])
    .await;
    let addr = gateway.local_addr();

    let slow_call = tokio::spawn(async move {
        let mut client = TestClient::connect(addr).await;
        client.request(1, &[0x03, 0x00, 0x00, 0x00, 0x01]).await
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    let mut client = TestClient::connect(addr).await;
    let started = Instant::now();
    assert_eq!(
        client.request(2, &[0x03, 0x00, 0x00, 0x00, 0x01]).await,
        vec![0x03, 0x02, 0x00, 0x00]
    );
    assert!(started.elapsed() < Duration::from_millis(150));

    assert_eq!(slow_call.await.unwrap(), vec![0x83, 0x04]);
    let health = gateway.routing().lookup(1).unwrap().health();
    assert!(health.last_error.unwrap().contains("Timeout"));

    // The late reply is discarded and the same connection keeps working
    slow.set_delay(Duration::ZERO);
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(
        client.request(1, &[0x03, 0x00, 0x00, 0x00, 0x01]).await,
        vec![0x03, 0x02, 0x00, 0x00]
    );
    assert_eq!(slow.connections.load(std::sync::atomic::Ordering::SeqCst), 1);

    gateway.stop().await;
}

#[tokio::test]
async fn test_concurrent_clients_same_slave() {
    let slave = StubSlave::start().await;
    {
        let mut bank = slave.bank.lock();
        for (i, reg) in bank.holding.iter_mut().enumerate() {
            *reg = (i * 3) as u16;
        }
    }
    let gateway = start_gateway(vec![slave.spec(7)]).await;
    let addr = gateway.local_addr();

    let mut tasks = Vec::new();
    for worker in 0u16..4 {
        tasks.push(tokio::spawn(async move {
            let mut client = TestClient::connect(addr).await;
            for round in 0u16..10 {
                let address = worker * 100 + round;
                let mut pdu = vec![0x03];
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&[0x00, 0x01]);
                let reply = client.request(7, &pdu).await;
                let expected = address * 3;
                assert_eq!(reply[2..], expected.to_be_bytes());
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(slave.requests.load(std::sync::atomic::Ordering::SeqCst), 40);

    gateway.stop().await;
}

#[tokio::test]
async fn test_framing_error_closes_only_that_connection() {
    let slave = StubSlave::start().await;
    let gateway = start_gateway(vec![slave.spec(1)]).await;

    let mut healthy = TestClient::connect(gateway.local_addr()).await;
    let mut broken = TestClient::connect(gateway.local_addr()).await;

    // Protocol id 1 is not Modbus
    broken
        .send_raw(&[0x00, 0x01, 0x00, 0x01, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01])
        .await;
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(2), broken.stream_mut().read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(read, 0);

    assert_eq!(
        healthy.request(1, &[0x03, 0x00, 0x00, 0x00, 0x01]).await,
        vec![0x03, 0x02, 0x00, 0x00]
    );

    // Listener still accepts
    let mut late = TestClient::connect(gateway.local_addr()).await;
    assert_eq!(
        late.request(1, &[0x03, 0x00, 0x00, 0x00, 0x01]).await,
        vec![0x03, 0x02, 0x00, 0x00]
    );

    gateway.stop().await;
}

#[tokio::test]
async fn test_stop_fails_in_flight_request() {
    let slave = StubSlave::start().await;
    slave.set_delay(Duration::from_secs(3));
    let gateway = start_gateway(vec![slave.spec(1).with_timeout(Duration::from_secs(10))]).await;
    let addr = gateway.local_addr();

    let in_flight = tokio::spawn(async move {
        let mut client = TestClient::connect(addr).await;
        client.request(1, &[0x03, 0x00, 0x00, 0x00, 0x01]).await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let routing = gateway.routing().clone();
    let started = Instant::now();
    gateway.stop().await;
    assert!(started.elapsed() < Duration::from_secs(2));

    assert_eq!(in_flight.await.unwrap(), vec![0x83, 0x04]);
    assert!(routing.connections().all(|c| c.is_closed()));
    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_start_fails_when_backend_unreachable() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead_port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut config = GatewayConfig::new([ServerSpec::tcp(4, "127.0.0.1", dead_port)
        .with_timeout(Duration::from_millis(500))]);
    config.listen_port = 0;

    let err = Gateway::start(&config).await.err().unwrap();
    assert!(matches!(err, ServiceError::BackendInit { slave_id: 4, .. }));
}

#[tokio::test]
async fn test_start_fails_when_port_taken() {
    let slave = StubSlave::start().await;
    let taken = std::net::TcpListener::bind("0.0.0.0:0").unwrap();

    let mut config = GatewayConfig::new([slave.spec(1)]);
    config.listen_port = taken.local_addr().unwrap().port();

    let err = Gateway::start(&config).await.err().unwrap();
    assert!(matches!(err, ServiceError::Bind { .. }));

    // The backend opened before the bind attempt is released again
    slave.wait_for_disconnects(1).await;
}
