//! Integration tests: full negotiation DESCRIBE → SETUP → PLAY against a
//! scripted in-memory transport, plus the failure and teardown paths.
//!
//! The scripted transport answers every command by posting the scripted
//! completion to the session's scheduler, exactly the way a real
//! transport implementation would, so these tests exercise the event
//! loop, the state machine, and the relays end to end across threads.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use rtsp_client::{
    AbsoluteRange, ClientConfig, Frame, MediaTransport, Result, RtspClient, Scheduler,
    SessionDescription, SessionEvent, StreamError, SubsessionDescriptor, SubsessionId,
    TransportBinding,
};

/// How a scripted subsession behaves once its frames are exhausted.
#[derive(Clone, Copy, PartialEq)]
enum EndBehavior {
    /// Transport end of stream.
    Close,
    /// Explicit RTCP BYE.
    Bye,
    /// Keep the source open but deliver nothing further.
    Stall,
}

#[derive(Clone)]
struct SubScript {
    medium: &'static str,
    codec: &'static str,
    initiate_ok: bool,
    setup_ok: bool,
    frames: u32,
    end: EndBehavior,
    parameter_set: Option<&'static [u8]>,
}

impl SubScript {
    fn video(frames: u32, end: EndBehavior) -> Self {
        Self {
            medium: "video",
            codec: "H264",
            initiate_ok: true,
            setup_ok: true,
            frames,
            end,
            parameter_set: None,
        }
    }

    fn audio(frames: u32, end: EndBehavior) -> Self {
        Self {
            medium: "audio",
            codec: "MPEG4-GENERIC",
            initiate_ok: true,
            setup_ok: true,
            frames,
            end,
            parameter_set: None,
        }
    }

    fn with_parameter_set(mut self, parameter_set: &'static [u8]) -> Self {
        self.parameter_set = Some(parameter_set);
        self
    }

    fn failing_setup(mut self) -> Self {
        self.setup_ok = false;
        self
    }

    fn failing_initiate(mut self) -> Self {
        self.initiate_ok = false;
        self
    }
}

#[derive(Clone, Default)]
struct Script {
    describe_error: Option<&'static str>,
    subsessions: Vec<SubScript>,
    play_error: Option<&'static str>,
    absolute_start: Option<&'static str>,
    play_end_secs: f64,
}

/// Commands the transport observed, for assertions.
#[derive(Default)]
struct TransportLog {
    setups: Vec<usize>,
    teardowns: usize,
    detaches: Vec<usize>,
    played: bool,
    play_start: Option<String>,
}

struct ScriptedTransport {
    script: Script,
    events: Option<Scheduler>,
    log: Arc<Mutex<TransportLog>>,
    served: Vec<u32>,
    ended: Vec<bool>,
}

impl ScriptedTransport {
    fn new(script: Script, log: Arc<Mutex<TransportLog>>) -> Self {
        let count = script.subsessions.len();
        Self {
            script,
            events: None,
            log,
            served: vec![0; count],
            ended: vec![false; count],
        }
    }

    fn post(&self, event: SessionEvent) {
        self.events.as_ref().expect("transport attached").post(event);
    }
}

impl MediaTransport for ScriptedTransport {
    fn attach(&mut self, events: Scheduler) {
        self.events = Some(events);
    }

    fn send_describe(&mut self, _url: &str) {
        let result = match self.script.describe_error {
            Some(message) => Err(StreamError::Negotiation(message.to_string())),
            None => Ok("v=0\r\ns=Scripted Stream\r\n".to_string()),
        };
        self.post(SessionEvent::DescribeComplete(result));
    }

    fn parse_description(&mut self, _sdp: &str) -> Result<SessionDescription> {
        Ok(SessionDescription {
            subsessions: self
                .script
                .subsessions
                .iter()
                .enumerate()
                .map(|(index, sub)| SubsessionDescriptor {
                    medium: sub.medium.to_string(),
                    codec: sub.codec.to_string(),
                    control: Some(format!("track{}", index + 1)),
                })
                .collect(),
            absolute_range: self.script.absolute_start.map(|start| AbsoluteRange {
                start: start.to_string(),
                end: None,
            }),
            play_start_secs: 0.0,
            play_end_secs: self.script.play_end_secs,
        })
    }

    fn initiate_subsession(
        &mut self,
        id: SubsessionId,
        descriptor: &SubsessionDescriptor,
        _over_tcp: bool,
    ) -> Result<TransportBinding> {
        if !self.script.subsessions[id.0].initiate_ok {
            return Err(StreamError::SubsessionInit(format!(
                "no port pair available for {}",
                descriptor.label()
            )));
        }
        let rtp = 5000 + (id.0 as u16) * 2;
        Ok(TransportBinding {
            client_rtp_port: rtp,
            client_rtcp_port: rtp + 1,
            rtcp_muxed: false,
        })
    }

    fn send_setup(&mut self, id: SubsessionId, _binding: &TransportBinding) {
        self.log.lock().setups.push(id.0);
        let result = if self.script.subsessions[id.0].setup_ok {
            Ok(())
        } else {
            Err(StreamError::SubsessionInit(
                "461 Unsupported Transport".to_string(),
            ))
        };
        self.post(SessionEvent::SetupComplete(id, result));
    }

    fn send_play(&mut self, range: Option<&AbsoluteRange>) {
        {
            let mut log = self.log.lock();
            log.played = true;
            log.play_start = range.map(|r| r.start.clone());
        }
        let result = match self.script.play_error {
            Some(message) => Err(StreamError::Negotiation(message.to_string())),
            None => Ok(()),
        };
        self.post(SessionEvent::PlayComplete(result));
    }

    fn send_teardown(&mut self) {
        self.log.lock().teardowns += 1;
    }

    fn request_frame(&mut self, id: SubsessionId) {
        let sub = &self.script.subsessions[id.0];
        if self.served[id.0] < sub.frames {
            self.served[id.0] += 1;
            let seq = self.served[id.0];
            self.post(SessionEvent::FrameReady(
                id,
                Frame {
                    payload: Bytes::from(vec![seq as u8; 64]),
                    truncated_bytes: 0,
                    presentation_time_us: i64::from(seq),
                    duration_us: 33_333,
                },
            ));
        } else if !self.ended[id.0] {
            self.ended[id.0] = true;
            match sub.end {
                EndBehavior::Close => self.post(SessionEvent::SourceClosed(id)),
                EndBehavior::Bye => self.post(SessionEvent::ByeReceived(id)),
                EndBehavior::Stall => {}
            }
        }
    }

    fn parameter_set(&self, id: SubsessionId) -> Option<Bytes> {
        self.script.subsessions[id.0]
            .parameter_set
            .map(Bytes::from_static)
    }

    fn detach(&mut self, id: SubsessionId) {
        self.log.lock().detaches.push(id.0);
    }
}

fn open_scripted(script: Script) -> (RtspClient, Arc<Mutex<TransportLog>>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let log = Arc::new(Mutex::new(TransportLog::default()));
    let transport = ScriptedTransport::new(script, log.clone());
    let client = RtspClient::open(
        "rtsp://127.0.0.1:8554/stream",
        Box::new(transport),
        ClientConfig::default(),
    );
    (client, log)
}

fn wait_for(condition: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

const SPS_PPS: &[u8] = &[0x67, 0x42, 0x00, 0x1e, 0x68, 0xce, 0x38, 0x80];

#[test]
fn full_negotiation_delivers_frames() {
    let (client, log) = open_scripted(Script {
        subsessions: vec![
            SubScript::video(3, EndBehavior::Stall).with_parameter_set(SPS_PPS),
            SubScript::audio(2, EndBehavior::Stall),
        ],
        ..Script::default()
    });

    assert!(
        wait_for(
            || client.state() == rtsp_client::StreamState::Playing,
            Duration::from_secs(2)
        ),
        "session never reached Playing, state: {:?}",
        client.state()
    );

    // Latest-wins: the slot holds the last served frame of each stream.
    assert!(
        wait_for(
            || {
                client
                    .retrieve_frame(SubsessionId(0))
                    .is_some_and(|frame| frame.payload == Bytes::from(vec![3u8; 64]))
            },
            Duration::from_secs(2)
        ),
        "video relay never delivered the last frame"
    );
    let audio = client
        .retrieve_frame(SubsessionId(1))
        .expect("audio frame available");
    assert_eq!(audio.payload, Bytes::from(vec![2u8; 64]));

    assert_eq!(
        client.retrieve_parameter_set(SubsessionId(0)),
        Some(Bytes::from_static(SPS_PPS)),
        "parameter set negotiated out-of-band must be retrievable"
    );
    assert_eq!(client.retrieve_parameter_set(SubsessionId(1)), None);

    let infos = client.subsessions();
    assert_eq!(infos.len(), 2);
    assert_eq!(infos[0].medium, "video");
    assert_eq!(infos[1].medium, "audio");

    // SETUPs were issued one at a time, in description order.
    assert_eq!(log.lock().setups, vec![0, 1]);

    client.join();
    assert_eq!(log.lock().teardowns, 1, "active session must tear down once");
}

#[test]
fn setup_failure_does_not_stop_other_subsessions() {
    let (client, log) = open_scripted(Script {
        subsessions: vec![
            SubScript::video(2, EndBehavior::Stall).failing_setup(),
            SubScript::audio(2, EndBehavior::Stall),
        ],
        ..Script::default()
    });

    assert!(wait_for(
        || client.state() == rtsp_client::StreamState::Playing,
        Duration::from_secs(2)
    ));
    assert!(log.lock().played, "PLAY must proceed with the surviving subsession");

    // Only the surviving subsession was registered.
    let infos = client.subsessions();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].id, SubsessionId(1));
    assert!(client.retrieve_frame(SubsessionId(0)).is_none());
    assert!(wait_for(
        || client.retrieve_frame(SubsessionId(1)).is_some(),
        Duration::from_secs(2)
    ));

    // Both SETUPs were still attempted, in order.
    assert_eq!(log.lock().setups, vec![0, 1]);

    client.join();
    assert_eq!(log.lock().teardowns, 1);
}

#[test]
fn initiate_failure_skips_straight_to_next_subsession() {
    let (client, log) = open_scripted(Script {
        subsessions: vec![
            SubScript::video(1, EndBehavior::Stall).failing_initiate(),
            SubScript::audio(1, EndBehavior::Stall),
        ],
        ..Script::default()
    });

    assert!(wait_for(
        || client.state() == rtsp_client::StreamState::Playing,
        Duration::from_secs(2)
    ));
    // No SETUP for the subsession that failed to initiate.
    assert_eq!(log.lock().setups, vec![1]);
    assert!(wait_for(
        || client.retrieve_frame(SubsessionId(1)).is_some(),
        Duration::from_secs(2)
    ));
    client.join();
}

#[test]
fn describe_failure_closes_without_teardown() {
    let (client, log) = open_scripted(Script {
        describe_error: Some("401 Unauthorized"),
        ..Script::default()
    });

    assert!(wait_for(|| client.is_closed(), Duration::from_secs(2)));
    assert!(client.retrieve_frame(SubsessionId(0)).is_none());
    let log = log.lock();
    assert_eq!(log.teardowns, 0);
    assert!(log.setups.is_empty());
    assert!(!log.played);
}

#[test]
fn empty_description_closes_without_teardown() {
    let (client, log) = open_scripted(Script::default());

    assert!(wait_for(|| client.is_closed(), Duration::from_secs(2)));
    let log = log.lock();
    assert_eq!(log.teardowns, 0);
    assert!(!log.played);
}

#[test]
fn play_failure_tears_down_active_subsessions() {
    let (client, log) = open_scripted(Script {
        subsessions: vec![SubScript::video(2, EndBehavior::Stall)],
        play_error: Some("500 Internal Server Error"),
        ..Script::default()
    });

    assert!(wait_for(|| client.is_closed(), Duration::from_secs(2)));
    let log = log.lock();
    assert_eq!(log.teardowns, 1, "PLAY failure with an active subsession tears down");
    assert_eq!(log.detaches, vec![0]);
}

#[test]
fn stopping_twice_sends_one_teardown() {
    let (client, log) = open_scripted(Script {
        subsessions: vec![SubScript::video(1, EndBehavior::Stall)],
        ..Script::default()
    });

    assert!(wait_for(
        || client.state() == rtsp_client::StreamState::Playing,
        Duration::from_secs(2)
    ));
    client.stop();
    client.stop();
    client.join();
    assert_eq!(log.lock().teardowns, 1);
}

#[test]
fn all_subsessions_closing_shuts_down_before_the_timer() {
    let started = Instant::now();
    // A 30 s expected duration arms the guard at 32 s; both subsessions
    // end almost immediately, so shutdown must come from aggregation,
    // long before the guard.
    let (client, log) = open_scripted(Script {
        subsessions: vec![
            SubScript::video(2, EndBehavior::Bye),
            SubScript::audio(1, EndBehavior::Close),
        ],
        play_end_secs: 30.0,
        ..Script::default()
    });

    assert!(
        wait_for(|| client.is_closed(), Duration::from_secs(3)),
        "aggregated end of stream must close the session immediately"
    );
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "shutdown must not wait for the duration guard"
    );

    client.join();

    // Sinks all closed naturally before shutdown: nothing left to tear down.
    let log = log.lock();
    assert_eq!(log.teardowns, 0);
    assert!(log.detaches.is_empty());
}

#[test]
fn duration_guard_fires_after_expected_duration_plus_slop() {
    let started = Instant::now();
    // 0.5 s expected duration, no end-of-stream signal: the guard fires
    // at 0.5 + 2 s.
    let (client, log) = open_scripted(Script {
        subsessions: vec![SubScript::video(1, EndBehavior::Stall)],
        play_end_secs: 0.5,
        ..Script::default()
    });

    assert!(wait_for(
        || client.state() == rtsp_client::StreamState::Playing,
        Duration::from_secs(2)
    ));

    std::thread::sleep(Duration::from_millis(1000));
    assert!(
        !client.is_closed(),
        "guard must not fire before duration + slop"
    );

    assert!(
        wait_for(|| client.is_closed(), Duration::from_secs(5)),
        "guard never fired"
    );
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(2300),
        "guard fired too early: {:?}",
        elapsed
    );

    let log = log.lock();
    assert_eq!(log.teardowns, 1, "stalled subsession was still active");
    assert_eq!(log.detaches, vec![0]);
}

#[test]
fn absolute_time_stream_plays_with_bounds() {
    let (client, log) = open_scripted(Script {
        subsessions: vec![SubScript::video(1, EndBehavior::Stall)],
        absolute_start: Some("20260101T000000Z"),
        play_end_secs: 600.0,
        ..Script::default()
    });

    assert!(wait_for(
        || client.state() == rtsp_client::StreamState::Playing,
        Duration::from_secs(2)
    ));
    assert_eq!(
        log.lock().play_start.as_deref(),
        Some("20260101T000000Z"),
        "PLAY must carry the description's absolute start"
    );
    client.join();
}
