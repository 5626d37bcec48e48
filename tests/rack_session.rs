mod common;

use adam5k_lib::client::{Adam5K, ClientState, TickKind};
use adam5k_lib::protocol::{ChannelAddress, ChannelValue, RackAddress, SlotGroup, SlotPattern};
use adam5k_lib::{Error, StateError};
use assert_matches::assert_matches;
use common::{FakeDevice, ANALOG_BASE, DIGITAL_WORD};
use std::net::TcpListener;
use std::sync::mpsc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn connected(device: &FakeDevice) -> Adam5K {
    let client = Adam5K::new();
    client
        .connect("127.0.0.1", device.port(), RackAddress::default())
        .unwrap();
    client
}

#[test]
fn idle_reads_and_writes() {
    let device = FakeDevice::start();
    let client = connected(&device);
    assert_eq!(client.state(), ClientState::Idle);

    let analog = ChannelAddress::new(SlotGroup::Analog, 2, 1).unwrap();
    assert_eq!(
        client.read_channel(analog).unwrap(),
        ChannelValue::Analog(ANALOG_BASE + 17)
    );
    let on = ChannelAddress::new(SlotGroup::Digital, 1, 2).unwrap();
    let off = ChannelAddress::new(SlotGroup::Digital, 1, 1).unwrap();
    assert_eq!(client.read_channel(on).unwrap(), ChannelValue::Digital(true));
    assert_eq!(client.read_channel(off).unwrap(), ChannelValue::Digital(false));

    client
        .write_channel(analog, ChannelValue::Analog(0x04C6))
        .unwrap();
    client
        .write_slot(0, &SlotPattern::Coils(vec![true; 16]))
        .unwrap();

    let snapshot = client.refresh().unwrap();
    assert_eq!(snapshot.analog()[63], ANALOG_BASE + 63);
    assert_eq!(snapshot.digital(), &[DIGITAL_WORD; 8]);

    let frames = device.frames();
    assert_eq!(
        frames[3],
        vec![0x00, 0x00, 0x00, 0x00, 0x00, 0x06, 0x01, 0x06, 0x00, 0x11, 0x04, 0xC6]
    );
    assert_eq!(
        frames[4],
        vec![
            0x00, 0x00, 0x00, 0x00, 0x00, 0x09, 0x01, 0x0F, 0x00, 0x00, 0x00, 0x20, 0x02, 0xFF,
            0xFF
        ]
    );

    client.disconnect();
    assert!(device.wait_closed(WAIT));
}

#[test]
fn polling_session() {
    let device = FakeDevice::start();
    let client = connected(&device);

    let (tx, rx) = mpsc::channel();
    client.set_tick_callback(move |tick| {
        let _ = tx.send(tick.outcome.as_ref().ok().copied());
    });
    client.start_polling(Duration::from_millis(50)).unwrap();
    assert_eq!(client.state(), ClientState::Polling);
    assert_matches!(
        client.start_polling(Duration::from_millis(50)),
        Err(Error::State(StateError::AlreadyPolling))
    );

    assert_eq!(
        rx.recv_timeout(WAIT).unwrap(),
        Some(TickKind::SnapshotRefreshed)
    );
    let address = ChannelAddress::new(SlotGroup::Analog, 0, 5).unwrap();
    assert_eq!(
        client.read_channel(address).unwrap(),
        ChannelValue::Analog(ANALOG_BASE + 5)
    );

    client
        .write_channel(address, ChannelValue::Analog(1234))
        .unwrap();
    while rx.recv_timeout(WAIT).unwrap() != Some(TickKind::CommandExecuted) {}
    assert_eq!(client.pending_commands(), 0);

    // The write replaced one full read and went out between two of them.
    let functions = device.functions();
    let write = functions.iter().position(|&f| f == 0x06).unwrap();
    assert_eq!(functions[write - 2..write], [0x04, 0x01]);

    client.stop_polling().unwrap();
    assert_eq!(client.state(), ClientState::Idle);
    let sent = device.frames().len();
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(device.frames().len(), sent);

    client.disconnect();
    assert_eq!(client.state(), ClientState::Disconnected);
    assert!(device.wait_closed(WAIT));
}

#[test]
fn disconnect_while_polling_closes_the_socket() {
    let device = FakeDevice::start();
    let client = connected(&device);
    client.start_polling(Duration::from_millis(20)).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    client.disconnect();
    assert_eq!(client.state(), ClientState::Disconnected);
    assert!(device.wait_closed(WAIT));
}

#[test]
fn connect_to_a_closed_port_fails() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let client = Adam5K::new();
    assert_matches!(
        client.connect("127.0.0.1", port, RackAddress::default()),
        Err(Error::Connection { .. })
    );
    assert_eq!(client.state(), ClientState::Disconnected);
}
