//! Orchestrator (C6): owns the UDP socket pair and wires the FEC/RED
//! engine, playback buffer and adaptive controller together into a
//! running transport session.
//!
//! Structured the way the teacher structures its stream workers: a thin
//! [`Engine`] handle holding a command channel, and an [`EngineInner`]
//! worker spawned onto its own task and driven by a `tokio::select!` loop
//! until cooperative shutdown is triggered.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use async_shutdown::ShutdownManager;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::controller::AdaptiveController;
use crate::fec::{FecConfig, FecEngine};
use crate::jitter::PlaybackBuffer;
use crate::rtcp::{self, ReceiverReport, RtcpPacket};
use crate::rtp::{seq_distance, Packet};

/// Datagrams this large or larger never occur on a sanely configured
/// network path; used only to size the receive buffer.
const MAX_DATAGRAM_LEN: usize = 65_536;
const PLAYBACK_TICK: Duration = Duration::from_millis(5);
const PLAYBACK_BATCH: usize = 32;
/// If this many inbound packets accumulate without a parity packet
/// arriving to trigger a recovery flush, flush anyway so memory doesn't
/// grow unbounded when an entire parity packet is lost.
const MAX_PENDING_INBOUND: usize = 64;
/// RTCP reports are emitted every 1-2s (§6 "RTCP").
const RTCP_TICK: Duration = Duration::from_millis(1500);
/// Fixed RTP timestamp advance per outgoing frame, 90 kHz clock at 30 fps.
const FRAME_TIMESTAMP_ADVANCE: u32 = 3000;

#[derive(Clone)]
pub struct Engine {
	outbound_tx: mpsc::Sender<(Bytes, bool)>,
}

impl Engine {
	/// Bind the local media (`port`) and RTCP (`port + 1`) sockets and
	/// spawn the worker task. `remote` is the peer this session exchanges
	/// packets with; this crate has no signaling channel (§1 Non-goals),
	/// so the peer address is supplied by the caller.
	pub async fn bind(config: Config, remote: SocketAddr, ssrc: u32, shutdown: ShutdownManager<()>) -> Result<(Self, mpsc::Receiver<Bytes>), ()> {
		let socket = UdpSocket::bind((config.address.as_str(), config.port))
			.await
			.map_err(|e| tracing::error!("failed to bind media socket: {e}"))?;
		let rtcp_socket = UdpSocket::bind((config.address.as_str(), config.port + 1))
			.await
			.map_err(|e| tracing::error!("failed to bind RTCP socket: {e}"))?;

		tracing::debug!(
			"listening for media on {}, RTCP on {}",
			socket.local_addr().map_err(|e| tracing::error!("failed to get local address of media socket: {e}"))?,
			rtcp_socket.local_addr().map_err(|e| tracing::error!("failed to get local address of RTCP socket: {e}"))?
		);

		let mut remote_rtcp = remote;
		remote_rtcp.set_port(remote.port() + 1);

		let (outbound_tx, outbound_rx) = mpsc::channel(1024);
		let (decoded_tx, decoded_rx) = mpsc::channel(1024);

		let inner = EngineInner::new(&config, ssrc);
		tokio::spawn(inner.run(socket, rtcp_socket, remote, remote_rtcp, config, shutdown, outbound_rx, decoded_tx));

		Ok((Self { outbound_tx }, decoded_rx))
	}

	/// Queue an outgoing media frame. `marker` should be set on the last
	/// packet of a frame, matching RTP's usual marker-bit convention.
	pub async fn send_media(&self, payload: Bytes, marker: bool) -> Result<(), ()> {
		self.outbound_tx.send((payload, marker)).await.map_err(|e| tracing::warn!("failed to queue outbound media: {e}"))
	}
}

struct EngineInner {
	fec_tx: FecEngine,
	fec_rx: FecEngine,
	playback: PlaybackBuffer,
	controller: AdaptiveController,

	ssrc: u32,
	sequence: u16,
	timestamp: u32,
	inbound_pending: Vec<Packet>,

	rtcp_prev_lost: u64,
	rtcp_prev_attempted: u64,
}

impl EngineInner {
	fn new(config: &Config, ssrc: u32) -> Self {
		let fec_config = FecConfig {
			group_size: config.fec.group_size,
			enable_red: config.fec.enable_red,
			min_protection_ratio: config.fec.min_protection_ratio,
			max_protection_ratio: config.fec.max_protection_ratio,
			..Default::default()
		};

		Self {
			fec_tx: FecEngine::new(fec_config.clone(), config.fec.initial_protection_ratio, ssrc),
			fec_rx: FecEngine::new(fec_config, config.fec.initial_protection_ratio, ssrc),
			playback: PlaybackBuffer::new(config.jitter.target_delay_ms, config.jitter.max_delay_ms, config.jitter.reorder_tolerance),
			controller: AdaptiveController::new(config.into(), config.fec.initial_protection_ratio),
			ssrc,
			sequence: 0,
			timestamp: 0,
			inbound_pending: Vec::new(),
			rtcp_prev_lost: 0,
			rtcp_prev_attempted: 0,
		}
	}

	#[allow(clippy::too_many_arguments)]
	async fn run(
		mut self,
		socket: UdpSocket,
		rtcp_socket: UdpSocket,
		remote: SocketAddr,
		remote_rtcp: SocketAddr,
		config: Config,
		shutdown: ShutdownManager<()>,
		mut outbound_rx: mpsc::Receiver<(Bytes, bool)>,
		decoded_tx: mpsc::Sender<Bytes>,
	) {
		let _delay_stop = shutdown.delay_shutdown_token();

		let mut recv_buf = vec![0u8; MAX_DATAGRAM_LEN];
		let mut rtcp_buf = vec![0u8; MAX_DATAGRAM_LEN];
		let mut adapt_ticker = tokio::time::interval(config.controller.adapt_interval);
		let mut playback_ticker = tokio::time::interval(PLAYBACK_TICK);
		let mut rtcp_ticker = tokio::time::interval(RTCP_TICK);

		loop {
			tokio::select! {
				_ = shutdown.wait_shutdown_triggered() => break,

				frame = outbound_rx.recv() => {
					match frame {
						Some((payload, marker)) => self.send_media(&socket, remote, payload, marker).await,
						None => break,
					}
				}

				received = socket.recv_from(&mut recv_buf) => {
					match received {
						Ok((len, addr)) if addr == remote => self.handle_inbound(&recv_buf[..len]),
						Ok((_, addr)) => tracing::trace!("dropping media datagram from unexpected peer {addr}"),
						Err(e) => tracing::warn!("failed to receive media datagram: {e}"),
					}
				}

				received = rtcp_socket.recv_from(&mut rtcp_buf) => {
					match received {
						Ok((len, addr)) if addr == remote_rtcp => self.handle_rtcp(&rtcp_buf[..len]),
						Ok((_, addr)) => tracing::trace!("dropping RTCP datagram from unexpected peer {addr}"),
						Err(e) => tracing::warn!("failed to receive RTCP datagram: {e}"),
					}
				}

				_ = adapt_ticker.tick() => self.run_adaptation(),

				_ = playback_ticker.tick() => self.drain_playback(&decoded_tx).await,

				_ = rtcp_ticker.tick() => self.send_receiver_report(&rtcp_socket, remote_rtcp).await,
			}
		}

		tracing::debug!("media engine stopped");
	}

	async fn send_media(&mut self, socket: &UdpSocket, remote: SocketAddr, payload: Bytes, marker: bool) {
		let packet = Packet::new(crate::rtp::PT_MEDIA, marker, self.sequence, self.timestamp, self.ssrc, payload);
		self.timestamp = self.timestamp.wrapping_add(FRAME_TIMESTAMP_ADVANCE);

		let outgoing = self.fec_tx.protect(packet.clone());
		self.advance_sequence(&packet, &outgoing);

		for out_packet in &outgoing {
			let wire = out_packet.serialize();
			if let Err(e) = socket.send_to(&wire, remote).await {
				tracing::warn!("failed to send media packet: {e}");
			}
		}
	}

	/// After a group flush, skip `self.sequence` past every sequence
	/// number `protect` just consumed (parity packets claim sequence
	/// numbers beyond the media packet that triggered the flush).
	fn advance_sequence(&mut self, sent: &Packet, outgoing: &[Packet]) {
		let mut max_seq = sent.sequence;
		for packet in outgoing {
			if seq_distance(packet.sequence, sent.sequence) > seq_distance(max_seq, sent.sequence) {
				max_seq = packet.sequence;
			}
		}
		self.sequence = max_seq.wrapping_add(1);
	}

	fn handle_inbound(&mut self, bytes: &[u8]) {
		let packet = match Packet::parse(bytes) {
			Ok(packet) => packet,
			Err(e) => {
				tracing::trace!("dropping unparseable datagram: {e}");
				return;
			}
		};

		let is_parity = packet.payload_type == crate::rtp::PT_FEC;
		self.inbound_pending.push(packet);

		if is_parity || self.inbound_pending.len() >= MAX_PENDING_INBOUND {
			self.flush_inbound();
		}
	}

	fn flush_inbound(&mut self) {
		let batch = std::mem::take(&mut self.inbound_pending);
		for packet in self.fec_rx.recover(batch) {
			self.playback.push(packet);
		}
	}

	fn handle_rtcp(&mut self, bytes: &[u8]) {
		match rtcp::parse(bytes) {
			Some(RtcpPacket::ReceiverReport(report)) => {
				tracing::trace!("received RTCP RR: fraction_lost={}", report.fraction_lost);
				self.controller.record_loss(report.fraction_lost_ratio());
			}
			Some(RtcpPacket::SenderReport(_)) => {}
			None => tracing::trace!("dropping unparseable RTCP datagram"),
		}
	}

	async fn send_receiver_report(&mut self, rtcp_socket: &UdpSocket, remote_rtcp: SocketAddr) {
		let stats = self.fec_rx.stats();
		let attempted = stats.packets_recovered + stats.packets_lost;

		let interval_attempted = attempted.saturating_sub(self.rtcp_prev_attempted);
		let interval_lost = stats.packets_lost.saturating_sub(self.rtcp_prev_lost);
		self.rtcp_prev_attempted = attempted;
		self.rtcp_prev_lost = stats.packets_lost;

		let fraction_lost = if interval_attempted > 0 { ((interval_lost * 256) / interval_attempted).min(255u64) as u8 } else { 0 };

		let report = ReceiverReport {
			reporter_ssrc: self.ssrc,
			source_ssrc: self.ssrc,
			fraction_lost,
			cumulative_lost: stats.packets_lost.min(u32::MAX as u64) as u32,
			highest_seq: self.sequence as u32,
			jitter: self.playback.stats().avg_jitter_ms as u32,
		};

		if let Err(e) = rtcp_socket.send_to(&report.serialize(), remote_rtcp).await {
			tracing::warn!("failed to send RTCP receiver report: {e}");
		}
	}

	fn run_adaptation(&mut self) {
		let jitter_stats = self.playback.stats();
		if jitter_stats.avg_jitter_ms > 0.0 {
			self.controller.record_jitter_ms(jitter_stats.avg_jitter_ms);
		}

		if let Some(adaptation) = self.controller.tick(Instant::now()) {
			if adaptation.protection_ratio_changed {
				tracing::debug!("protection ratio {} -> {}", self.fec_tx.protection_ratio(), adaptation.protection_ratio);
				self.fec_tx.set_protection_ratio(adaptation.protection_ratio);
			}
			if adaptation.bitrate_changed {
				tracing::debug!("target bitrate now {} bps", adaptation.bitrate);
			}
		}
	}

	async fn drain_playback(&mut self, decoded_tx: &mpsc::Sender<Bytes>) {
		for packet in self.playback.pop_batch(PLAYBACK_BATCH) {
			if decoded_tx.send(packet.payload).await.is_err() {
				tracing::trace!("decoded-media receiver dropped");
				return;
			}
		}
	}
}
