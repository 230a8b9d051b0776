mod common;

use audio_protocol::{vad_flags, AudioPacket, HeaderExtension, PacketHeader};
use common::{RecordingSink, Rig};
use howdy_edge::config::UdpConfig;
use howdy_edge::streamer::{FrameSink, UdpAudioStreamer};
use howdy_edge::{ConversationState, EdgeConfig};
use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

fn server_socket() -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    socket
}

/// Everything queued on `socket` right now.
fn received(socket: &UdpSocket) -> Vec<(PacketHeader, usize, Vec<i16>)> {
    let mut buf = [0u8; 2048];
    let mut packets = Vec::new();
    while let Ok((len, _)) = socket.recv_from(&mut buf) {
        let packet = AudioPacket::parse(&buf[..len]).unwrap();
        packets.push((packet.header, len, packet.samples().collect()));
    }
    packets
}

fn streaming_rig(server: &UdpSocket) -> (Rig, Arc<UdpAudioStreamer>) {
    streaming_rig_with(server, UdpConfig::default())
}

fn streaming_rig_with(server: &UdpSocket, udp: UdpConfig) -> (Rig, Arc<UdpAudioStreamer>) {
    let config = EdgeConfig::default();
    let streamer = Arc::new(UdpAudioStreamer::init(udp, 16000).unwrap());
    streamer.set_server("127.0.0.1".parse().unwrap(), server.local_addr().unwrap().port());
    let (rig, _) = Rig::build(config, streamer.clone(), Arc::new(RecordingSink::default()));
    (rig, streamer)
}

#[test]
fn test_recording_streams_one_packet_per_frame() {
    let server = server_socket();
    let (mut rig, streamer) = streaming_rig(&server);

    rig.enter_recording();
    // The activation frame and the ten frames of speech onset.
    let onset = received(&server);
    assert_eq!(onset.len(), 11);

    let first = streamer.next_sequence();
    assert_eq!(first, 11);
    rig.voice(10);

    let packets = received(&server);
    assert_eq!(packets.len(), 10);
    for (i, (header, len, samples)) in packets.iter().enumerate() {
        assert_eq!(header.sequence, first + i as u32);
        assert_eq!(*len, 652);
        assert_eq!(header.sample_count, 320);
        assert_eq!(header.sample_rate, 16000);
        assert_eq!(header.channels, 1);
        assert_eq!(header.bits_per_sample, 16);
        assert_eq!(samples.len(), 320);
    }
    assert_eq!(streamer.stats().packets_sent, 21);
    assert_eq!(rig.processor.stats().frames_streamed, 21);
}

#[test]
fn test_sequence_survives_turns() {
    let server = server_socket();
    let (mut rig, streamer) = streaming_rig(&server);

    rig.enter_recording();
    assert_eq!(rig.silence(42), ConversationState::Processing);
    assert!(!streamer.is_streaming());
    let after_first_turn = received(&server);
    let last = after_first_turn.last().unwrap().0.sequence;

    // Processing times out, then a fresh activation.
    rig.silence(751);
    assert_eq!(rig.processor.state(), ConversationState::Waiting);
    rig.enter_recording();

    let second_turn = received(&server);
    assert_eq!(second_turn.first().unwrap().0.sequence, last + 1);
    let sequences: Vec<u32> = second_turn.iter().map(|(h, _, _)| h.sequence).collect();
    assert!(sequences.windows(2).all(|w| w[1] == w[0] + 1));
}

#[test]
fn test_failed_send_keeps_sequence() {
    let streamer = UdpAudioStreamer::init(UdpConfig::default(), 16000).unwrap();
    streamer.start_stream();

    // No server address yet.
    assert!(streamer.send_frame(&[0i16; 320]).is_err());
    assert_eq!(streamer.next_sequence(), 0);

    let server = server_socket();
    streamer.set_server("127.0.0.1".parse().unwrap(), server.local_addr().unwrap().port());
    streamer.send_frame(&[0i16; 320]).unwrap();
    assert_eq!(streamer.next_sequence(), 1);
    assert_eq!(received(&server)[0].0.sequence, 0);
}

#[test]
fn test_frames_outside_streaming_states_stay_local() {
    let server = server_socket();
    let (mut rig, streamer) = streaming_rig(&server);

    rig.silence(50);
    assert!(received(&server).is_empty());
    assert_eq!(streamer.stats().packets_sent, 0);
    assert_eq!(rig.processor.stats().frames_streamed, 0);
}

#[test]
fn test_enhanced_header_reports_voice_activity() {
    let server = server_socket();
    let udp = UdpConfig {
        enhanced_header: true,
        ..UdpConfig::default()
    };
    let (mut rig, _streamer) = streaming_rig_with(&server, udp);

    rig.enter_recording();
    received(&server);
    rig.voice(5);

    let mut buf = [0u8; 2048];
    let mut voiced = 0;
    while let Ok((len, _)) = server.recv_from(&mut buf) {
        let packet = AudioPacket::parse(&buf[..len]).unwrap();
        let extension: HeaderExtension = packet.extension.expect("extension present");
        assert_eq!(len, 652 + extension.wire_len());
        let vad = extension.vad();
        if vad.flags & vad_flags::VOICE_ACTIVE != 0 {
            voiced += 1;
            assert!(vad.max_amplitude > 3000);
        }
    }
    assert_eq!(voiced, 5);
}
