use super::*;
use crate::mocks::{MockControlTransport, MockControlTransportInner};
use crate::transport::TransportError;
use futures::{future, Future};
use mockall::Sequence;
use std::pin::{pin, Pin};
use std::sync::Arc;
use std::task::{Poll, Wake, Waker};

struct NoOpWaker;

impl Wake for NoOpWaker {
    fn wake(self: Arc<Self>) {}
}

type PinnedIn =
    Pin<Box<dyn Future<Output = Result<Vec<u8>, TransportError>>>>;
type PinnedOut =
    Pin<Box<dyn Future<Output = Result<usize, TransportError>>>>;

trait PollExtras<T> {
    fn to_option(self) -> Option<T>;
}

impl<T> PollExtras<T> for Poll<T> {
    fn to_option(self) -> Option<T> {
        match self {
            Poll::Ready(t) => Some(t),
            _ => None,
        }
    }
}

fn is_class_interface(s: &SetupPacket) -> bool {
    s.request_type == RequestType::Class
        && s.recipient == Recipient::Interface
        && s.index == 0
}

fn is_get_status(s: &SetupPacket, length: &u16) -> bool {
    is_class_interface(s)
        && s.request == DFU_GETSTATUS
        && s.value == 0
        && *length == 6
}

fn is_get_state(s: &SetupPacket, length: &u16) -> bool {
    is_class_interface(s)
        && s.request == DFU_GETSTATE
        && s.value == 0
        && *length == 1
}

fn control_out_ok(_: SetupPacket, _: &[u8]) -> PinnedOut {
    Box::pin(future::ready(Ok(0)))
}

fn control_in_ok_with(
    bytes: Vec<u8>,
) -> impl FnMut(SetupPacket, u16) -> PinnedIn {
    move |_, _| Box::pin(future::ready(Ok(bytes.clone())))
}

fn delay_ok(_: u32) -> Pin<Box<dyn Future<Output = ()>>> {
    Box::pin(future::ready(()))
}

fn status_bytes(status: u8, timeout: u32, state: u8) -> Vec<u8> {
    vec![
        status,
        timeout as u8,
        (timeout >> 8) as u8,
        (timeout >> 16) as u8,
        state,
        0,
    ]
}

trait ExtraExpectations {
    fn expect_get_status(
        &mut self,
        seq: &mut Sequence,
        status: u8,
        timeout: u32,
        state: u8,
    );
    fn expect_delay(&mut self, seq: &mut Sequence, ms: u32);
    fn expect_request(&mut self, seq: &mut Sequence, request: u8);
    fn expect_get_state(&mut self, seq: &mut Sequence, state: u8);
}

impl ExtraExpectations for MockControlTransportInner {
    fn expect_get_status(
        &mut self,
        seq: &mut Sequence,
        status: u8,
        timeout: u32,
        state: u8,
    ) {
        self.expect_control_in()
            .times(1)
            .in_sequence(seq)
            .withf(is_get_status)
            .returning(control_in_ok_with(status_bytes(
                status, timeout, state,
            )));
    }

    fn expect_delay(&mut self, seq: &mut Sequence, ms: u32) {
        self.expect_delay_ms()
            .times(1)
            .in_sequence(seq)
            .withf(move |m| *m == ms)
            .returning(delay_ok);
    }

    fn expect_request(&mut self, seq: &mut Sequence, request: u8) {
        self.expect_control_out()
            .times(1)
            .in_sequence(seq)
            .withf(move |s, d| {
                is_class_interface(s)
                    && s.request == request
                    && s.value == 0
                    && d.is_empty()
            })
            .returning(control_out_ok);
    }

    fn expect_get_state(&mut self, seq: &mut Sequence, state: u8) {
        self.expect_control_in()
            .times(1)
            .in_sequence(seq)
            .withf(is_get_state)
            .returning(control_in_ok_with(vec![state]));
    }
}

fn do_test<
    SetupFn: FnMut(&mut MockControlTransportInner),
    TestFn: FnMut(&mut core::task::Context, &MockControlTransport),
>(
    mut setup: SetupFn,
    mut test: TestFn,
) {
    let w = Waker::from(Arc::new(NoOpWaker));
    let mut c = core::task::Context::from_waker(&w);

    let mut hc = MockControlTransport::default();
    setup(&mut hc.inner);
    test(&mut c, &hc);
}

#[test]
fn status_report_decodes() {
    let r =
        StatusReport::parse(&[0x00, 0xE8, 0x03, 0x00, 0x05, 0x00]).unwrap();
    assert_eq!(r.status, 0);
    assert_eq!(r.poll_timeout_ms, 1000);
    assert_eq!(r.state, DfuState::DownloadIdle);
}

#[test]
fn status_report_timeout_is_24_bit() {
    let r =
        StatusReport::parse(&[0x00, 0xFF, 0xFF, 0xFF, 0x02, 0x09]).unwrap();
    assert_eq!(r.poll_timeout_ms, 0xFF_FFFF);
    assert_eq!(r.state, DfuState::Idle);
}

#[test]
fn status_report_too_short() {
    assert_eq!(
        StatusReport::parse(&[0, 0, 0, 0, 2]),
        Err(Error::MalformedDescriptor("status report"))
    );
}

#[test]
fn unknown_state_preserved() {
    assert_eq!(DfuState::from(11), DfuState::Other(11));
    assert_eq!(DfuState::from(0xFF), DfuState::Other(0xFF));
}

#[test]
fn write_block_is_dnload() {
    do_test(
        |hc| {
            hc.expect_control_out()
                .times(1)
                .withf(|s, d| {
                    is_class_interface(s)
                        && s.request == DFU_DNLOAD
                        && s.value == 3
                        && d == [1, 2, 3]
                })
                .returning(|_, d| {
                    Box::pin(future::ready(Ok(d.len())))
                });
        },
        |c, hc| {
            let link = DfuLink::new(hc, 0);
            let r = pin!(link.write_block(3, &[1, 2, 3]));
            assert_eq!(r.poll(c).to_option().unwrap(), Ok(3));
        },
    );
}

#[test]
fn read_block_is_upload() {
    do_test(
        |hc| {
            hc.expect_control_in()
                .times(1)
                .withf(|s, length| {
                    is_class_interface(s)
                        && s.request == DFU_UPLOAD
                        && s.value == 7
                        && *length == 256
                })
                .returning(control_in_ok_with(vec![0xAA; 256]));
        },
        |c, hc| {
            let link = DfuLink::new(hc, 0);
            let r = pin!(link.read_block(7, 256));
            let data = r.poll(c).to_option().unwrap().unwrap();
            assert_eq!(data.len(), 256);
        },
    );
}

#[test]
fn detach_carries_timeout() {
    do_test(
        |hc| {
            hc.expect_control_out()
                .times(1)
                .withf(|s, d| {
                    is_class_interface(s)
                        && s.request == DFU_DETACH
                        && s.value == 500
                        && d.is_empty()
                })
                .returning(control_out_ok);
        },
        |c, hc| {
            let link = DfuLink::new(hc, 0);
            let r = pin!(link.detach(500));
            assert_eq!(r.poll(c).to_option().unwrap(), Ok(()));
        },
    );
}

#[test]
fn poll_until_returns_immediately_when_satisfied() {
    do_test(
        |hc| {
            let mut seq = Sequence::new();
            hc.expect_get_status(&mut seq, 0, 5, 2);
            // no expect_delay_ms: a sleep here would be a test failure
        },
        |c, hc| {
            let link = DfuLink::new(hc, 0);
            let r = pin!(link.poll_until(|s| s == DfuState::Idle));
            let report = r.poll(c).to_option().unwrap().unwrap();
            assert_eq!(report.state, DfuState::Idle);
        },
    );
}

#[test]
fn poll_until_sleeps_every_timeout_but_the_last() {
    do_test(
        |hc| {
            let mut seq = Sequence::new();
            hc.expect_get_status(&mut seq, 0, 10, 4);
            hc.expect_delay(&mut seq, 10);
            hc.expect_get_status(&mut seq, 0, 20, 4);
            hc.expect_delay(&mut seq, 20);
            hc.expect_get_status(&mut seq, 0, 99, 5);
        },
        |c, hc| {
            let link = DfuLink::new(hc, 0);
            let r = pin!(link.poll_until(|s| s == DfuState::DownloadIdle));
            let report = r.poll(c).to_option().unwrap().unwrap();
            assert_eq!(report.state, DfuState::DownloadIdle);
            assert_eq!(report.poll_timeout_ms, 99);
        },
    );
}

#[test]
fn poll_until_stops_in_error_state() {
    do_test(
        |hc| {
            let mut seq = Sequence::new();
            hc.expect_get_status(&mut seq, 0, 10, 4);
            hc.expect_delay(&mut seq, 10);
            hc.expect_get_status(&mut seq, 0x0E, 0, 10);
        },
        |c, hc| {
            let link = DfuLink::new(hc, 0);
            let r = pin!(link.poll_until(|s| s == DfuState::Idle));
            let report = r.poll(c).to_option().unwrap().unwrap();
            assert_eq!(report.state, DfuState::Error);
            assert_eq!(report.status, 0x0E);
        },
    );
}

#[test]
fn poll_until_idle_rejects_bad_status() {
    do_test(
        |hc| {
            let mut seq = Sequence::new();
            hc.expect_get_status(&mut seq, 0x0A, 0, 5);
        },
        |c, hc| {
            let link = DfuLink::new(hc, 0);
            let r = pin!(link.poll_until_idle("write"));
            assert_eq!(
                r.poll(c).to_option().unwrap(),
                Err(Error::Protocol {
                    state: DfuState::DownloadIdle,
                    status: 0x0A,
                    phase: "write",
                })
            );
        },
    );
}

#[test]
fn poll_until_idle_rejects_error_state() {
    do_test(
        |hc| {
            let mut seq = Sequence::new();
            hc.expect_get_status(&mut seq, 0x0E, 0, 10);
        },
        |c, hc| {
            let link = DfuLink::new(hc, 0);
            let r = pin!(link.poll_until_idle("erase"));
            assert_eq!(
                r.poll(c).to_option().unwrap(),
                Err(Error::Protocol {
                    state: DfuState::Error,
                    status: 0x0E,
                    phase: "erase",
                })
            );
        },
    );
}

#[test]
fn abort_to_idle_direct() {
    do_test(
        |hc| {
            let mut seq = Sequence::new();
            hc.expect_request(&mut seq, DFU_ABORT);
            hc.expect_get_state(&mut seq, 2);
        },
        |c, hc| {
            let link = DfuLink::new(hc, 0);
            let r = pin!(link.abort_to_idle());
            assert_eq!(r.poll(c).to_option().unwrap(), Ok(()));
        },
    );
}

#[test]
fn abort_to_idle_clears_error_state() {
    do_test(
        |hc| {
            let mut seq = Sequence::new();
            hc.expect_request(&mut seq, DFU_ABORT);
            hc.expect_get_state(&mut seq, 10);
            hc.expect_request(&mut seq, DFU_CLRSTATUS);
            hc.expect_get_state(&mut seq, 2);
        },
        |c, hc| {
            let link = DfuLink::new(hc, 0);
            let r = pin!(link.abort_to_idle());
            assert_eq!(r.poll(c).to_option().unwrap(), Ok(()));
        },
    );
}

#[test]
fn abort_to_idle_fails_when_stuck() {
    do_test(
        |hc| {
            let mut seq = Sequence::new();
            hc.expect_request(&mut seq, DFU_ABORT);
            hc.expect_get_state(&mut seq, 5);
        },
        |c, hc| {
            let link = DfuLink::new(hc, 0);
            let r = pin!(link.abort_to_idle());
            assert_eq!(
                r.poll(c).to_option().unwrap(),
                Err(Error::Protocol {
                    state: DfuState::DownloadIdle,
                    status: STATUS_OK,
                    phase: "abort did not reach idle",
                })
            );
        },
    );
}

#[test]
fn transport_errors_propagate() {
    do_test(
        |hc| {
            hc.expect_control_in()
                .times(1)
                .withf(is_get_status)
                .returning(|_, _| {
                    Box::pin(future::ready(Err(TransportError::Stall)))
                });
        },
        |c, hc| {
            let link = DfuLink::new(hc, 0);
            let r = pin!(link.get_status());
            assert_eq!(
                r.poll(c).to_option().unwrap(),
                Err(Error::Transport(TransportError::Stall))
            );
        },
    );
}
