//! Zone-transfer stream consumer.
//!
//! A transfer is a sequence of DNS messages on one TCP stream whose ANSWER
//! sections, concatenated, form an SOA-delimited record stream. The tracker
//! below decides, record by record, whether the stream is an AXFR or an IXFR
//! and when it is complete. It is purely synchronous; the TCP driver feeds it
//! one message at a time and keeps reading for as long as it says `Continue`.

use hickory_proto::op::Message;
use hickory_proto::rr::{RData, Record};

/// What kind of transfer the lookup asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XfrMode {
    Axfr,
    /// Incremental transfer; `client_serial` is the serial the client already
    /// has and sent in the authority section of the request.
    Ixfr { client_serial: u32 },
}

/// How a finished transfer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The stream was delimited normally.
    Complete,
    /// IXFR: the server's serial is not newer than the client's, nothing to
    /// transfer.
    UpToDate,
    /// IXFR: the second record repeated the first SOA, an empty zone.
    EmptyZone,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// Need more data, request the next message on the same stream.
    Continue,
    /// Stream is complete.
    Done(Completion),
    /// The record limit was hit; the current message has been consumed.
    LimitReached,
    /// The stream is not a well-formed transfer.
    Failed(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingFirstSoa,
    FirstSoaSeen,
    InAxfr,
    InIxfr,
    Terminal,
}

/// Per-query transfer bookkeeping, driven once per RR in arrival order.
#[derive(Debug, Clone)]
pub struct XfrTracker {
    mode: XfrMode,
    state: State,
    first_soa_rcvd: bool,
    first_rr_serial: u32,
    second_rr_rcvd: bool,
    second_rr_serial: u32,
    first_repeat_rcvd: bool,
    rr_count: usize,
    rr_limit: Option<usize>,
}

impl XfrTracker {
    pub fn new(mode: XfrMode, rr_limit: Option<usize>) -> XfrTracker {
        XfrTracker {
            mode,
            state: State::AwaitingFirstSoa,
            first_soa_rcvd: false,
            first_rr_serial: 0,
            second_rr_rcvd: false,
            second_rr_serial: 0,
            first_repeat_rcvd: false,
            rr_count: 0,
            rr_limit,
        }
    }

    pub fn mode(&self) -> XfrMode {
        self.mode
    }

    pub fn first_soa_rcvd(&self) -> bool {
        self.first_soa_rcvd
    }

    pub fn first_rr_serial(&self) -> u32 {
        self.first_rr_serial
    }

    pub fn second_rr_rcvd(&self) -> bool {
        self.second_rr_rcvd
    }

    pub fn second_rr_serial(&self) -> u32 {
        self.second_rr_serial
    }

    pub fn first_repeat_rcvd(&self) -> bool {
        self.first_repeat_rcvd
    }

    /// Cumulative count of answer records consumed, across messages.
    pub fn rr_count(&self) -> usize {
        self.rr_count
    }

    pub fn over_limit(&self) -> bool {
        matches!(self.rr_limit, Some(limit) if self.rr_count >= limit)
    }

    /// Consumes the ANSWER section of one inbound message. Records after a
    /// terminal record are ignored.
    pub fn observe_message(&mut self, message: &Message) -> Progress {
        for rr in message.answers() {
            match self.observe_record(rr) {
                Progress::Continue => {}
                terminal => return terminal,
            }
        }
        if self.over_limit() {
            Progress::LimitReached
        } else {
            Progress::Continue
        }
    }

    /// Advances the state machine by one record.
    pub fn observe_record(&mut self, rr: &Record) -> Progress {
        let soa_serial = match rr.data() {
            RData::SOA(soa) => Some(soa.serial()),
            _ => None,
        };
        self.rr_count += 1;

        match self.state {
            State::AwaitingFirstSoa => match soa_serial {
                None => {
                    self.state = State::Terminal;
                    Progress::Failed("transfer did not start with an SOA record")
                }
                Some(serial) => {
                    self.first_soa_rcvd = true;
                    self.first_rr_serial = serial;
                    match self.mode {
                        XfrMode::Ixfr { client_serial } if client_serial >= serial => {
                            self.state = State::Terminal;
                            Progress::Done(Completion::UpToDate)
                        }
                        XfrMode::Ixfr { .. } => {
                            self.state = State::FirstSoaSeen;
                            Progress::Continue
                        }
                        // For AXFR the answer is simple: first SOA begins the
                        // stream, the next SOA ends it.
                        XfrMode::Axfr => {
                            self.state = State::InAxfr;
                            Progress::Continue
                        }
                    }
                }
            },
            State::FirstSoaSeen => match soa_serial {
                None => {
                    // The server ignored the IXFR request and answers with a
                    // full transfer.
                    self.second_rr_rcvd = true;
                    self.second_rr_serial = 0;
                    self.state = State::InAxfr;
                    Progress::Continue
                }
                Some(serial) if serial == self.first_rr_serial => {
                    self.state = State::Terminal;
                    Progress::Done(Completion::EmptyZone)
                }
                Some(serial) => {
                    self.second_rr_rcvd = true;
                    self.second_rr_serial = serial;
                    self.state = State::InIxfr;
                    Progress::Continue
                }
            },
            State::InAxfr => match soa_serial {
                Some(_) => {
                    self.state = State::Terminal;
                    Progress::Done(Completion::Complete)
                }
                None => Progress::Continue,
            },
            State::InIxfr => match soa_serial {
                Some(serial) if serial == self.first_rr_serial => {
                    if self.first_repeat_rcvd {
                        self.state = State::Terminal;
                        Progress::Done(Completion::Complete)
                    } else {
                        self.first_repeat_rcvd = true;
                        Progress::Continue
                    }
                }
                // Intermediate SOAs delimit the IXFR's deletion and addition
                // sections and carry no termination meaning.
                _ => Progress::Continue,
            },
            State::Terminal => Progress::Continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spectral::prelude::*;

    use hickory_proto::rr::rdata::{A, NS, SOA};
    use hickory_proto::rr::Name;
    use std::str::FromStr;

    fn soa(serial: u32) -> Record {
        let name = Name::from_str("example.com.").unwrap();
        let rdata = SOA::new(
            Name::from_str("ns1.example.com.").unwrap(),
            Name::from_str("hostmaster.example.com.").unwrap(),
            serial,
            3600,
            900,
            86400,
            300,
        );
        Record::from_rdata(name, 300, RData::SOA(rdata))
    }

    fn a(addr: [u8; 4]) -> Record {
        let name = Name::from_str("www.example.com.").unwrap();
        Record::from_rdata(name, 300, RData::A(A::new(addr[0], addr[1], addr[2], addr[3])))
    }

    fn ns(target: &str) -> Record {
        let name = Name::from_str("example.com.").unwrap();
        Record::from_rdata(name, 300, RData::NS(NS(Name::from_str(target).unwrap())))
    }

    #[test]
    fn axfr_soa_delimited() {
        let mut tracker = XfrTracker::new(XfrMode::Axfr, None);

        assert_that(&tracker.observe_record(&soa(100))).is_equal_to(Progress::Continue);
        assert_that(&tracker.observe_record(&a([192, 0, 2, 1]))).is_equal_to(Progress::Continue);
        assert_that(&tracker.observe_record(&a([192, 0, 2, 2]))).is_equal_to(Progress::Continue);
        assert_that(&tracker.observe_record(&ns("ns1.example.com."))).is_equal_to(Progress::Continue);
        assert_that(&tracker.observe_record(&soa(100))).is_equal_to(Progress::Done(Completion::Complete));

        assert_that(&tracker.rr_count()).is_equal_to(5);
        assert_that(&tracker.first_rr_serial()).is_equal_to(100);
    }

    #[test]
    fn axfr_must_start_with_soa() {
        let mut tracker = XfrTracker::new(XfrMode::Axfr, None);

        let progress = tracker.observe_record(&a([192, 0, 2, 1]));

        assert_that(&matches!(progress, Progress::Failed(_))).is_true();
    }

    #[test]
    fn ixfr_up_to_date_after_one_record() {
        let mut tracker = XfrTracker::new(XfrMode::Ixfr { client_serial: 42 }, None);

        let progress = tracker.observe_record(&soa(42));

        assert_that(&progress).is_equal_to(Progress::Done(Completion::UpToDate));
        assert_that(&tracker.rr_count()).is_equal_to(1);
    }

    #[test]
    fn ixfr_client_ahead_of_server() {
        let mut tracker = XfrTracker::new(XfrMode::Ixfr { client_serial: 50 }, None);

        assert_that(&tracker.observe_record(&soa(42))).is_equal_to(Progress::Done(Completion::UpToDate));
    }

    #[test]
    fn ixfr_trivial_empty_zone() {
        let mut tracker = XfrTracker::new(XfrMode::Ixfr { client_serial: 1 }, None);

        assert_that(&tracker.observe_record(&soa(100))).is_equal_to(Progress::Continue);
        assert_that(&tracker.observe_record(&soa(100))).is_equal_to(Progress::Done(Completion::EmptyZone));
    }

    #[test]
    fn ixfr_ends_on_first_serial_repeat() {
        let mut tracker = XfrTracker::new(XfrMode::Ixfr { client_serial: 1 }, None);

        // new serial, then one delta: deletions from 90, additions up to 100
        assert_that(&tracker.observe_record(&soa(100))).is_equal_to(Progress::Continue);
        assert_that(&tracker.observe_record(&soa(90))).is_equal_to(Progress::Continue);
        assert_that(&tracker.observe_record(&a([192, 0, 2, 1]))).is_equal_to(Progress::Continue);
        // intermediate SOA opening the addition section
        assert_that(&tracker.observe_record(&soa(100))).is_equal_to(Progress::Continue);
        assert_that(&tracker.first_repeat_rcvd()).is_true();
        assert_that(&tracker.observe_record(&a([192, 0, 2, 2]))).is_equal_to(Progress::Continue);
        assert_that(&tracker.observe_record(&soa(100))).is_equal_to(Progress::Done(Completion::Complete));
    }

    #[test]
    fn ixfr_fallback_to_axfr_style_stream() {
        let mut tracker = XfrTracker::new(XfrMode::Ixfr { client_serial: 1 }, None);

        assert_that(&tracker.observe_record(&soa(100))).is_equal_to(Progress::Continue);
        // non-SOA second record means the server answered with a full zone
        assert_that(&tracker.observe_record(&a([192, 0, 2, 1]))).is_equal_to(Progress::Continue);
        assert_that(&tracker.second_rr_rcvd()).is_true();
        assert_that(&tracker.second_rr_serial()).is_equal_to(0);
        assert_that(&tracker.observe_record(&soa(100))).is_equal_to(Progress::Done(Completion::Complete));
    }

    #[test]
    fn record_limit_reported_after_message() {
        let mut tracker = XfrTracker::new(XfrMode::Axfr, Some(3));
        let mut message = Message::new();
        message.add_answer(soa(100));
        message.add_answer(a([192, 0, 2, 1]));
        message.add_answer(a([192, 0, 2, 2]));
        message.add_answer(a([192, 0, 2, 3]));

        let progress = tracker.observe_message(&message);

        // the message is consumed in full, the limit reported afterwards
        assert_that(&progress).is_equal_to(Progress::LimitReached);
        assert_that(&tracker.rr_count()).is_equal_to(4);
    }

    #[test]
    fn completion_wins_over_record_limit() {
        let mut tracker = XfrTracker::new(XfrMode::Axfr, Some(2));
        let mut message = Message::new();
        message.add_answer(soa(100));
        message.add_answer(a([192, 0, 2, 1]));
        message.add_answer(soa(100));

        assert_that(&tracker.observe_message(&message)).is_equal_to(Progress::Done(Completion::Complete));
    }

    #[test]
    fn multi_message_axfr_continues_across_messages() {
        let mut tracker = XfrTracker::new(XfrMode::Axfr, None);

        let mut first = Message::new();
        first.add_answer(soa(7));
        first.add_answer(a([192, 0, 2, 1]));
        let mut second = Message::new();
        second.add_answer(a([192, 0, 2, 2]));
        let mut last = Message::new();
        last.add_answer(soa(7));

        assert_that(&tracker.observe_message(&first)).is_equal_to(Progress::Continue);
        assert_that(&tracker.observe_message(&second)).is_equal_to(Progress::Continue);
        assert_that(&tracker.observe_message(&last)).is_equal_to(Progress::Done(Completion::Complete));
        assert_that(&tracker.rr_count()).is_equal_to(4);
    }
}
