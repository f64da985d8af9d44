//! The handshake protocol engine.
//!
//! A sequential state machine with no I/O of its own: the connection
//! engine pushes decoded inbound records in with [`HandshakeEngine::deliver_record`]
//! and pulls outbound bytes with [`HandshakeEngine::dequeue_transmit`].
//!
//! Outgoing records accumulate into *flights*. A record that signals a key
//! update (ServerHello on the server, the client's final auth step,
//! KeyUpdate on either side) seals its flight: once the sealed bytes have
//! drained, transmission blocks until the caller confirms the replacement
//! transmit key via [`HandshakeEngine::install_tx_key`]. No handshake byte
//! is ever sent under a stale key, and records under different keys never
//! share a packet.
//!
//! Receive-key rotations are surfaced as [`HandshakeEvent::InstallRxKey`]
//! at the exact record boundary where they take effect; the driver must
//! apply them before opening any later packet.

use crate::error::HandshakeError;
use crate::handshake::record::{HandshakeRecord, RANDOM_SIZE};
use qlic_crypto::auth::{IdentityProvider, IdentityVerifier};
use qlic_crypto::kex::KeyExchange;
use qlic_crypto::schedule::{KeySchedule, SecurityLevel, TrafficKey, TrafficSecret};
use qlic_crypto::{random, CryptoGuard, TranscriptHash};
use std::collections::VecDeque;
use std::sync::Arc;

/// Which side of the connection this engine drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The connecting (companion) side; sends ClientHello
    Client,
    /// The accepting (wearable) side; sends ServerHello
    Server,
}

/// Events the engine hands back to its driver.
#[derive(Debug)]
pub enum HandshakeEvent {
    /// Replace the receive key before opening any subsequent packet
    InstallRxKey(TrafficKey),
    /// Both peers are authenticated and application keys are scheduled
    Established,
}

/// Deterministic overrides for tests plus future tuning knobs.
#[derive(Default)]
pub struct HandshakeConfig {
    /// Fix the hello random contribution (tests only)
    pub random_override: Option<[u8; RANDOM_SIZE]>,
    /// Fix the X25519 key-share secret (tests only)
    pub key_share_override: Option<[u8; 32]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitClientHello,
    AwaitServerHello,
    AwaitAuthRequest,
    AwaitServerAuthShare,
    AwaitServerAuthVerify,
    AwaitClientAuthShare,
    AwaitClientAuthVerify,
    Established,
}

impl State {
    fn expected(self) -> &'static str {
        match self {
            Self::AwaitClientHello => "ClientHello",
            Self::AwaitServerHello => "ServerHello",
            Self::AwaitAuthRequest => "AuthRequest",
            Self::AwaitServerAuthShare | Self::AwaitClientAuthShare => "AuthShare",
            Self::AwaitServerAuthVerify | Self::AwaitClientAuthVerify => "AuthVerify",
            Self::Established => "KeyUpdate",
        }
    }
}

/// One contiguous run of outgoing record bytes under a single transmit key.
struct Flight {
    bytes: Vec<u8>,
    cursor: usize,
    /// Key the transmit direction must rotate to once these bytes drain.
    pending_key: Option<TrafficKey>,
}

impl Flight {
    fn new() -> Self {
        Self {
            bytes: Vec::new(),
            cursor: 0,
            pending_key: None,
        }
    }

    fn unread(&self) -> usize {
        self.bytes.len() - self.cursor
    }

    fn sealed(&self) -> bool {
        self.pending_key.is_some()
    }
}

/// The QLIC handshake state machine.
pub struct HandshakeEngine {
    role: Role,
    state: State,
    transcript: TranscriptHash,
    kex: KeyExchange,
    local_random: [u8; RANDOM_SIZE],
    peer_random: Option<[u8; RANDOM_SIZE]>,
    provider: Arc<dyn IdentityProvider>,
    verifier: Arc<dyn IdentityVerifier>,
    guard: CryptoGuard,
    /// The two lists advertised in ClientHello (ours when client, the
    /// peer's when server).
    client_auth_algorithms: Vec<u64>,
    server_auth_algorithms: Vec<u64>,
    negotiated: Option<(u64, u64)>,
    schedule: Option<KeySchedule>,
    tx_secret: Option<TrafficSecret>,
    rx_secret: Option<TrafficSecret>,
    flights: VecDeque<Flight>,
    tx_blocked: bool,
    /// Records still expected in the current inbound key epoch; reaching
    /// zero means the engine is idle and the driver may safely rotate the
    /// receive key it was handed.
    expected_inbound: u32,
}

impl HandshakeEngine {
    /// Create the client-side engine. The ClientHello is queued
    /// immediately and waits for the first [`Self::dequeue_transmit`].
    ///
    /// # Errors
    ///
    /// Returns a [`HandshakeError`] if the CSPRNG or record encoding fails.
    pub fn new_client(
        config: HandshakeConfig,
        provider: Arc<dyn IdentityProvider>,
        verifier: Arc<dyn IdentityVerifier>,
        guard: CryptoGuard,
    ) -> Result<Self, HandshakeError> {
        let mut engine = Self::new(Role::Client, config, provider, verifier, guard)?;
        engine.client_auth_algorithms = engine.provider.algorithms();
        engine.server_auth_algorithms = engine.verifier.algorithms();

        let hello = HandshakeRecord::ClientHello {
            client_random: engine.local_random,
            key_share: engine.kex.public_share().to_vec(),
            client_auth_algorithms: engine.client_auth_algorithms.clone(),
            server_auth_algorithms: engine.server_auth_algorithms.clone(),
        };
        engine.emit(&hello)?;
        engine.state = State::AwaitServerHello;
        engine.expected_inbound = 1;
        Ok(engine)
    }

    /// Create the server-side engine, waiting for a ClientHello.
    ///
    /// # Errors
    ///
    /// Returns a [`HandshakeError`] if the CSPRNG fails.
    pub fn new_server(
        config: HandshakeConfig,
        provider: Arc<dyn IdentityProvider>,
        verifier: Arc<dyn IdentityVerifier>,
        guard: CryptoGuard,
    ) -> Result<Self, HandshakeError> {
        let mut engine = Self::new(Role::Server, config, provider, verifier, guard)?;
        engine.state = State::AwaitClientHello;
        engine.expected_inbound = 1;
        Ok(engine)
    }

    fn new(
        role: Role,
        config: HandshakeConfig,
        provider: Arc<dyn IdentityProvider>,
        verifier: Arc<dyn IdentityVerifier>,
        guard: CryptoGuard,
    ) -> Result<Self, HandshakeError> {
        let local_random = match config.random_override {
            Some(random) => random,
            None => random::random_32().map_err(HandshakeError::Crypto)?,
        };
        let kex = match config.key_share_override {
            Some(secret) => KeyExchange::from_secret_bytes(secret),
            None => KeyExchange::generate().map_err(HandshakeError::Crypto)?,
        };
        Ok(Self {
            role,
            state: State::AwaitClientHello,
            transcript: TranscriptHash::new(),
            kex,
            local_random,
            peer_random: None,
            provider,
            verifier,
            guard,
            client_auth_algorithms: Vec::new(),
            server_auth_algorithms: Vec::new(),
            negotiated: None,
            schedule: None,
            tx_secret: None,
            rx_secret: None,
            flights: VecDeque::new(),
            tx_blocked: false,
            expected_inbound: 0,
        })
    }

    /// This engine's role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether the handshake has completed.
    #[must_use]
    pub fn is_established(&self) -> bool {
        self.state == State::Established
    }

    /// The negotiated (client, server) algorithm identifiers, once known.
    #[must_use]
    pub fn negotiated_algorithms(&self) -> Option<(u64, u64)> {
        self.negotiated
    }

    /// Snapshot of the running transcript hash.
    #[must_use]
    pub fn transcript_hash(&self) -> [u8; 32] {
        self.transcript.current()
    }

    /// Records still expected in the current inbound key epoch. Zero means
    /// the engine is idle: the driver may safely resume packet decryption
    /// with whatever receive key it now holds.
    #[must_use]
    pub fn expected_inbound(&self) -> u32 {
        self.expected_inbound
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Deliver one decoded inbound record together with its exact wire
    /// bytes (for the transcript).
    ///
    /// # Errors
    ///
    /// Any error is fatal to the connection; there is no
    /// partial-handshake recovery.
    pub fn deliver_record(
        &mut self,
        record: HandshakeRecord,
        wire_bytes: &[u8],
    ) -> Result<Vec<HandshakeEvent>, HandshakeError> {
        self.expected_inbound = self.expected_inbound.saturating_sub(1);
        let mut events = Vec::new();

        match (self.state, record) {
            (
                State::AwaitClientHello,
                HandshakeRecord::ClientHello {
                    client_random,
                    key_share,
                    client_auth_algorithms,
                    server_auth_algorithms,
                },
            ) => {
                self.transcript.absorb(wire_bytes);
                self.peer_random = Some(client_random);
                self.client_auth_algorithms = client_auth_algorithms;
                self.server_auth_algorithms = server_auth_algorithms;

                let hello = HandshakeRecord::ServerHello {
                    server_random: self.local_random,
                    key_share: self.kex.public_share().to_vec(),
                };
                self.emit(&hello)?;

                let hello_hash = self.transcript.current();
                let shared = self.kex.shared_secret(&key_share)?;
                let schedule = KeySchedule::root(&shared, &hello_hash)?;
                let (client_hs, server_hs) =
                    schedule.expand_peer_secrets(SecurityLevel::Handshake, &hello_hash)?;
                self.schedule = Some(schedule);

                // ServerHello signals the tx key update; the hello itself
                // still leaves in cleartext.
                self.seal_flight(server_hs.traffic_key()?);
                events.push(HandshakeEvent::InstallRxKey(client_hs.traffic_key()?));

                self.negotiate()?;
                self.send_auth_flight()?;

                self.state = State::AwaitClientAuthShare;
                self.expected_inbound = 2;
                tracing::debug!("server hello sent, awaiting client authentication");
            }

            (
                State::AwaitServerHello,
                HandshakeRecord::ServerHello {
                    server_random,
                    key_share,
                },
            ) => {
                self.transcript.absorb(wire_bytes);
                self.peer_random = Some(server_random);

                let hello_hash = self.transcript.current();
                let shared = self.kex.shared_secret(&key_share)?;
                let schedule = KeySchedule::root(&shared, &hello_hash)?;
                let (client_hs, server_hs) =
                    schedule.expand_peer_secrets(SecurityLevel::Handshake, &hello_hash)?;
                self.schedule = Some(schedule);

                self.seal_flight(client_hs.traffic_key()?);
                events.push(HandshakeEvent::InstallRxKey(server_hs.traffic_key()?));

                self.state = State::AwaitAuthRequest;
                self.expected_inbound = 3;
                tracing::debug!("server hello received, handshake keys scheduled");
            }

            (
                State::AwaitAuthRequest,
                HandshakeRecord::AuthRequest {
                    client_algorithm_index,
                    server_algorithm_index,
                },
            ) => {
                self.transcript.absorb(wire_bytes);
                // Index 0 is reserved for retry-request extensions and is
                // an immediate failure today.
                let client_alg = lookup_algorithm(
                    &self.client_auth_algorithms,
                    client_algorithm_index,
                )?;
                let server_alg = lookup_algorithm(
                    &self.server_auth_algorithms,
                    server_algorithm_index,
                )?;
                self.negotiated = Some((client_alg, server_alg));
                self.state = State::AwaitServerAuthShare;
            }

            (State::AwaitServerAuthShare, HandshakeRecord::AuthShare { attestation }) => {
                self.transcript.absorb(wire_bytes);
                let (_, server_alg) = self.require_negotiated()?;
                let challenge = self.challenge()?;
                let verifier = self.verifier.clone();
                self.guard
                    .with(|| verifier.validate_attestation(server_alg, &challenge, &attestation))
                    .map_err(HandshakeError::AuthenticationFailed)?;
                self.state = State::AwaitServerAuthVerify;
            }

            (State::AwaitServerAuthVerify, HandshakeRecord::AuthVerify { signature }) => {
                let signed_hash = self.transcript.current();
                self.transcript.absorb(wire_bytes);
                let (client_alg, server_alg) = self.require_negotiated()?;
                let verifier = self.verifier.clone();
                self.guard
                    .with(|| verifier.verify(server_alg, &signed_hash, &signature))
                    .map_err(HandshakeError::AuthenticationFailed)?;

                // Server is authenticated; prove our own identity. The
                // final auth step signals the switch to application keys.
                self.send_client_auth(client_alg)?;

                let final_hash = self.transcript.current();
                let schedule = self
                    .schedule
                    .as_ref()
                    .ok_or(HandshakeError::NotEstablished)?;
                let (client_app, server_app) =
                    schedule.expand_peer_secrets(SecurityLevel::Application, &final_hash)?;
                self.seal_flight(client_app.traffic_key()?);
                events.push(HandshakeEvent::InstallRxKey(server_app.traffic_key()?));
                self.tx_secret = Some(client_app);
                self.rx_secret = Some(server_app);

                self.state = State::Established;
                self.expected_inbound = 0;
                events.push(HandshakeEvent::Established);
                tracing::debug!("handshake established (client)");
            }

            (State::AwaitClientAuthShare, HandshakeRecord::AuthShare { attestation }) => {
                self.transcript.absorb(wire_bytes);
                let (client_alg, _) = self.require_negotiated()?;
                let challenge = self.challenge()?;
                let verifier = self.verifier.clone();
                self.guard
                    .with(|| verifier.validate_attestation(client_alg, &challenge, &attestation))
                    .map_err(HandshakeError::AuthenticationFailed)?;
                self.state = State::AwaitClientAuthVerify;
            }

            (State::AwaitClientAuthVerify, HandshakeRecord::AuthVerify { signature }) => {
                let signed_hash = self.transcript.current();
                self.transcript.absorb(wire_bytes);
                let (client_alg, _) = self.require_negotiated()?;
                let verifier = self.verifier.clone();
                self.guard
                    .with(|| verifier.verify(client_alg, &signed_hash, &signature))
                    .map_err(HandshakeError::AuthenticationFailed)?;

                let final_hash = self.transcript.current();
                let schedule = self
                    .schedule
                    .as_ref()
                    .ok_or(HandshakeError::NotEstablished)?;
                let (client_app, server_app) =
                    schedule.expand_peer_secrets(SecurityLevel::Application, &final_hash)?;
                // Nothing left to send under handshake keys; seal an empty
                // flight so the tx switch still goes through confirmation.
                self.seal_flight(server_app.traffic_key()?);
                events.push(HandshakeEvent::InstallRxKey(client_app.traffic_key()?));
                self.tx_secret = Some(server_app);
                self.rx_secret = Some(client_app);

                self.state = State::Established;
                self.expected_inbound = 0;
                events.push(HandshakeEvent::Established);
                tracing::debug!("handshake established (server)");
            }

            (State::Established, HandshakeRecord::KeyUpdate { update_requested }) => {
                self.transcript.absorb(wire_bytes);
                let rx = self
                    .rx_secret
                    .as_ref()
                    .ok_or(HandshakeError::NotEstablished)?
                    .next()?;
                events.push(HandshakeEvent::InstallRxKey(rx.traffic_key()?));
                self.rx_secret = Some(rx);
                tracing::debug!(update_requested, "peer rotated its transmit key");

                if update_requested {
                    self.queue_key_update(false)?;
                }
            }

            // Only KeyUpdate is legal once established.
            (State::Established, _) => {
                return Err(HandshakeError::AlreadyComplete);
            }

            (state, record) => {
                return Err(HandshakeError::UnexpectedRecord {
                    expected: state.expected(),
                    got: record.record_type(),
                });
            }
        }

        Ok(events)
    }

    /// Rotate the transmit key, e.g. because the IV-use threshold was
    /// crossed. `request_peer_update` asks the peer to rotate as well.
    /// A no-op while a previous rotation is still awaiting confirmation.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::NotEstablished`] before completion.
    pub fn deliver_key_update_trigger(
        &mut self,
        request_peer_update: bool,
    ) -> Result<(), HandshakeError> {
        if self.state != State::Established {
            return Err(HandshakeError::NotEstablished);
        }
        if self.rotation_pending() {
            return Ok(());
        }
        self.queue_key_update(request_peer_update)
    }

    fn queue_key_update(&mut self, update_requested: bool) -> Result<(), HandshakeError> {
        self.emit(&HandshakeRecord::KeyUpdate { update_requested })?;
        let tx = self
            .tx_secret
            .as_ref()
            .ok_or(HandshakeError::NotEstablished)?
            .next()?;
        self.seal_flight(tx.traffic_key()?);
        self.tx_secret = Some(tx);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Whether any record bytes are queued for transmission.
    #[must_use]
    pub fn has_pending_transmit(&self) -> bool {
        self.flights.iter().any(|f| f.unread() > 0)
    }

    /// Whether transmission is blocked on a key-update confirmation.
    #[must_use]
    pub fn tx_blocked(&mut self) -> bool {
        self.advance();
        self.tx_blocked
    }

    /// Whether a transmit-key rotation is queued or awaiting confirmation.
    #[must_use]
    pub fn rotation_pending(&self) -> bool {
        self.tx_blocked || self.flights.iter().any(Flight::sealed)
    }

    /// Confirm the pending transmit key: returns the key the caller must
    /// install before the next dequeue, and unblocks transmission.
    pub fn install_tx_key(&mut self) -> Option<TrafficKey> {
        self.advance();
        if !self.tx_blocked {
            return None;
        }
        let flight = self.flights.pop_front()?;
        self.tx_blocked = false;
        self.advance();
        flight.pending_key
    }

    /// Dequeue up to `budget` bytes of the current flight. Never crosses a
    /// flight (key) boundary, so one call's bytes always share one key.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::KeyUpdateNotConfirmed`] when bytes are
    /// pending behind an unconfirmed key update.
    pub fn dequeue_transmit(&mut self, budget: usize) -> Result<Option<Vec<u8>>, HandshakeError> {
        self.advance();
        if self.tx_blocked {
            if self.has_pending_transmit() {
                return Err(HandshakeError::KeyUpdateNotConfirmed);
            }
            return Ok(None);
        }
        let Some(front) = self.flights.front_mut() else {
            return Ok(None);
        };
        let take = front.unread().min(budget);
        if take == 0 {
            return Ok(None);
        }
        let chunk = front.bytes[front.cursor..front.cursor + take].to_vec();
        front.cursor += take;
        self.advance();
        Ok(Some(chunk))
    }

    /// Drop front flights whose bytes have drained; park on a sealed one.
    fn advance(&mut self) {
        while !self.tx_blocked {
            match self.flights.front() {
                Some(front) if front.unread() == 0 => {
                    if front.sealed() {
                        self.tx_blocked = true;
                    } else {
                        self.flights.pop_front();
                    }
                }
                _ => break,
            }
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn emit(&mut self, record: &HandshakeRecord) -> Result<(), HandshakeError> {
        let bytes = record.to_bytes()?;
        self.transcript.absorb(&bytes);
        self.ensure_open_flight();
        if let Some(flight) = self.flights.back_mut() {
            flight.bytes.extend_from_slice(&bytes);
        }
        Ok(())
    }

    fn ensure_open_flight(&mut self) {
        if self.flights.back().is_none_or(Flight::sealed) {
            self.flights.push_back(Flight::new());
        }
    }

    fn seal_flight(&mut self, key: TrafficKey) {
        self.ensure_open_flight();
        if let Some(flight) = self.flights.back_mut() {
            flight.pending_key = Some(key);
        }
    }

    fn challenge(&self) -> Result<[u8; 64], HandshakeError> {
        let peer = self.peer_random.ok_or(HandshakeError::NotEstablished)?;
        let (client_random, server_random) = match self.role {
            Role::Client => (self.local_random, peer),
            Role::Server => (peer, self.local_random),
        };
        let mut challenge = [0u8; 64];
        challenge[..RANDOM_SIZE].copy_from_slice(&client_random);
        challenge[RANDOM_SIZE..].copy_from_slice(&server_random);
        Ok(challenge)
    }

    fn require_negotiated(&self) -> Result<(u64, u64), HandshakeError> {
        self.negotiated.ok_or(HandshakeError::NoCompatibleAlgorithm)
    }

    /// Server-side selection over the client's advertised lists.
    fn negotiate(&mut self) -> Result<(), HandshakeError> {
        let client_index = self
            .client_auth_algorithms
            .iter()
            .position(|alg| self.verifier.algorithms().contains(alg));
        let server_index = self
            .server_auth_algorithms
            .iter()
            .position(|alg| self.provider.algorithms().contains(alg));
        let (Some(client_index), Some(server_index)) = (client_index, server_index) else {
            tracing::warn!("no compatible authentication algorithm");
            return Err(HandshakeError::NoCompatibleAlgorithm);
        };
        self.negotiated = Some((
            self.client_auth_algorithms[client_index],
            self.server_auth_algorithms[server_index],
        ));
        // Wire indexes are 1-based; 0 is the reserved failure value.
        self.emit(&HandshakeRecord::AuthRequest {
            client_algorithm_index: (client_index + 1) as u64,
            server_algorithm_index: (server_index + 1) as u64,
        })
    }

    /// Server's AuthShare + AuthVerify, queued behind the sealed hello.
    fn send_auth_flight(&mut self) -> Result<(), HandshakeError> {
        let (_, server_alg) = self.require_negotiated()?;
        let challenge = self.challenge()?;
        let provider = self.provider.clone();
        let attestation = self
            .guard
            .with(|| provider.generate_attestation(server_alg, &challenge))
            .map_err(HandshakeError::Crypto)?;
        self.emit(&HandshakeRecord::AuthShare { attestation })?;

        let signed_hash = self.transcript.current();
        let signature = self
            .guard
            .with(|| provider.sign(server_alg, &signed_hash))
            .map_err(HandshakeError::Crypto)?;
        self.emit(&HandshakeRecord::AuthVerify { signature })
    }

    /// Client's AuthShare + AuthVerify.
    fn send_client_auth(&mut self, client_alg: u64) -> Result<(), HandshakeError> {
        let challenge = self.challenge()?;
        let provider = self.provider.clone();
        let attestation = self
            .guard
            .with(|| provider.generate_attestation(client_alg, &challenge))
            .map_err(HandshakeError::Crypto)?;
        self.emit(&HandshakeRecord::AuthShare { attestation })?;

        let signed_hash = self.transcript.current();
        let signature = self
            .guard
            .with(|| provider.sign(client_alg, &signed_hash))
            .map_err(HandshakeError::Crypto)?;
        self.emit(&HandshakeRecord::AuthVerify { signature })
    }
}

fn lookup_algorithm(advertised: &[u64], wire_index: u64) -> Result<u64, HandshakeError> {
    if wire_index == 0 || wire_index as usize > advertised.len() {
        return Err(HandshakeError::NoCompatibleAlgorithm);
    }
    Ok(advertised[wire_index as usize - 1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::record::RecordType;
    use crate::record::FrameReader;
    use qlic_crypto::auth::{PretrustedIdentity, PretrustedVerifier};
    use qlic_crypto::schedule::SecurityLevel;

    fn engine_pair() -> (HandshakeEngine, HandshakeEngine) {
        engine_pair_with(
            HandshakeConfig::default(),
            HandshakeConfig::default(),
        )
    }

    fn engine_pair_with(
        client_config: HandshakeConfig,
        server_config: HandshakeConfig,
    ) -> (HandshakeEngine, HandshakeEngine) {
        let client_identity = Arc::new(PretrustedIdentity::from_seed([0x01u8; 32]));
        let server_identity = Arc::new(PretrustedIdentity::from_seed([0x02u8; 32]));
        let verifies_server =
            Arc::new(PretrustedVerifier::new(server_identity.public_key()).unwrap());
        let verifies_client =
            Arc::new(PretrustedVerifier::new(client_identity.public_key()).unwrap());

        let client = HandshakeEngine::new_client(
            client_config,
            client_identity,
            verifies_server,
            CryptoGuard::new(),
        )
        .unwrap();
        let server = HandshakeEngine::new_server(
            server_config,
            server_identity,
            verifies_client,
            CryptoGuard::new(),
        )
        .unwrap();
        (client, server)
    }

    /// Drain every sendable byte from `from`, installing pending tx keys
    /// as the connection engine would, and deliver the records to `to`.
    fn pump(from: &mut HandshakeEngine, to: &mut HandshakeEngine) -> Vec<HandshakeEvent> {
        let mut events = Vec::new();
        loop {
            if from.tx_blocked() {
                from.install_tx_key().unwrap();
                continue;
            }
            let Some(chunk) = from.dequeue_transmit(usize::MAX).unwrap() else {
                break;
            };
            let mut reader = FrameReader::new(&chunk);
            while !reader.is_empty() {
                let mark = reader.mark();
                let record = HandshakeRecord::decode(&mut reader).unwrap();
                let wire = reader.taken_since(mark);
                events.extend(to.deliver_record(record, wire).unwrap());
            }
        }
        events
    }

    fn complete(client: &mut HandshakeEngine, server: &mut HandshakeEngine) {
        pump(client, server);
        pump(server, client);
        pump(client, server);
        assert!(client.is_established());
        assert!(server.is_established());
    }

    #[test]
    fn full_handshake_establishes_both_sides() {
        let (mut client, mut server) = engine_pair();
        assert_eq!(client.expected_inbound(), 1);
        assert_eq!(server.expected_inbound(), 1);
        complete(&mut client, &mut server);

        assert_eq!(client.expected_inbound(), 0);
        assert_eq!(server.expected_inbound(), 0);
        assert_eq!(client.negotiated_algorithms(), Some((1, 1)));
        assert_eq!(server.negotiated_algorithms(), Some((1, 1)));
        assert_eq!(client.transcript_hash(), server.transcript_hash());
    }

    #[test]
    fn fixed_inputs_reproduce_the_transcript() {
        let fixed = || {
            (
                HandshakeConfig {
                    random_override: Some([0x0Au8; 32]),
                    key_share_override: Some([0x0Bu8; 32]),
                },
                HandshakeConfig {
                    random_override: Some([0x0Cu8; 32]),
                    key_share_override: Some([0x0Du8; 32]),
                },
            )
        };

        let (cc, sc) = fixed();
        let (mut c1, mut s1) = engine_pair_with(cc, sc);
        complete(&mut c1, &mut s1);

        let (cc, sc) = fixed();
        let (mut c2, mut s2) = engine_pair_with(cc, sc);
        // Phase boundary: hashes agree after the hello exchange too.
        pump(&mut c2, &mut s2);
        let hello_hash = s2.transcript_hash();
        pump(&mut s2, &mut c2);
        pump(&mut c2, &mut s2);

        assert_eq!(c1.transcript_hash(), c2.transcript_hash());
        assert_ne!(hello_hash, c2.transcript_hash());
    }

    #[test]
    fn transmit_blocks_until_key_confirmed() {
        let (mut client, mut server) = engine_pair();
        pump(&mut client, &mut server);

        // ServerHello leaves in cleartext.
        let hello = server.dequeue_transmit(usize::MAX).unwrap().unwrap();
        assert_eq!(hello[0], RecordType::ServerHello as u8);

        // The auth flight is queued behind the sealed hello; sending it
        // before confirming the handshake key is a state error.
        assert!(matches!(
            server.dequeue_transmit(usize::MAX),
            Err(HandshakeError::KeyUpdateNotConfirmed)
        ));

        let key = server.install_tx_key().unwrap();
        assert_eq!(key.level(), SecurityLevel::Handshake);
        let flight = server.dequeue_transmit(usize::MAX).unwrap().unwrap();
        assert_eq!(flight[0], RecordType::AuthRequest as u8);
    }

    #[test]
    fn dequeue_respects_budget_and_flight_boundaries() {
        let (mut client, mut server) = engine_pair();
        pump(&mut client, &mut server);

        let mut hello = Vec::new();
        while let Some(chunk) = server.dequeue_transmit(3).unwrap() {
            assert!(chunk.len() <= 3);
            hello.extend_from_slice(&chunk);
            if server.tx_blocked() {
                break;
            }
        }
        assert_eq!(hello[0], RecordType::ServerHello as u8);
        assert!(server.install_tx_key().is_some());
    }

    #[test]
    fn incompatible_algorithms_fail_closed() {
        let client_identity = Arc::new(PretrustedIdentity::from_seed([0x01u8; 32]));
        let server_identity = Arc::new(PretrustedIdentity::from_seed([0x02u8; 32]));
        let verifies_server =
            Arc::new(PretrustedVerifier::new(server_identity.public_key()).unwrap());

        struct NoAlgorithms;
        impl qlic_crypto::auth::IdentityVerifier for NoAlgorithms {
            fn algorithms(&self) -> Vec<u64> {
                Vec::new()
            }
            fn validate_attestation(
                &self,
                algorithm: u64,
                _: &[u8],
                _: &[u8],
            ) -> Result<(), qlic_crypto::CryptoError> {
                Err(qlic_crypto::CryptoError::UnsupportedAlgorithm(algorithm))
            }
            fn verify(
                &self,
                algorithm: u64,
                _: &[u8],
                _: &[u8],
            ) -> Result<(), qlic_crypto::CryptoError> {
                Err(qlic_crypto::CryptoError::UnsupportedAlgorithm(algorithm))
            }
        }

        let mut client = HandshakeEngine::new_client(
            HandshakeConfig::default(),
            client_identity,
            verifies_server,
            CryptoGuard::new(),
        )
        .unwrap();
        let mut server = HandshakeEngine::new_server(
            HandshakeConfig::default(),
            server_identity,
            Arc::new(NoAlgorithms),
            CryptoGuard::new(),
        )
        .unwrap();

        let chunk = client.dequeue_transmit(usize::MAX).unwrap().unwrap();
        let mut reader = FrameReader::new(&chunk);
        let record = HandshakeRecord::decode(&mut reader).unwrap();
        let wire = reader.taken_since(0);
        assert!(matches!(
            server.deliver_record(record, wire),
            Err(HandshakeError::NoCompatibleAlgorithm)
        ));
    }

    #[test]
    fn zero_index_fails_immediately() {
        let (mut client, mut server) = engine_pair();
        pump(&mut client, &mut server);
        pump(&mut server, &mut client);
        // Client is established-track; now replay a forged AuthRequest
        // with index 0 against a fresh client stuck at AwaitAuthRequest.
        let (mut client2, mut server2) = engine_pair();
        pump(&mut client2, &mut server2);
        // Hand-deliver only the ServerHello to client2.
        let hello = server2.dequeue_transmit(usize::MAX).unwrap().unwrap();
        let mut reader = FrameReader::new(&hello);
        let record = HandshakeRecord::decode(&mut reader).unwrap();
        client2.deliver_record(record, reader.taken_since(0)).unwrap();

        let forged = HandshakeRecord::AuthRequest {
            client_algorithm_index: 0,
            server_algorithm_index: 1,
        };
        let wire = forged.to_bytes().unwrap();
        assert!(matches!(
            client2.deliver_record(forged, &wire),
            Err(HandshakeError::NoCompatibleAlgorithm)
        ));
        drop(client);
    }

    #[test]
    fn unexpected_record_carries_diagnostics() {
        let (_, mut server) = engine_pair();
        let record = HandshakeRecord::AuthShare {
            attestation: vec![0; 8],
        };
        let wire = record.to_bytes().unwrap();
        match server.deliver_record(record, &wire) {
            Err(HandshakeError::UnexpectedRecord { expected, got }) => {
                assert_eq!(expected, "ClientHello");
                assert_eq!(got, RecordType::AuthShare);
            }
            other => panic!("expected UnexpectedRecord, got {other:?}"),
        }
    }

    #[test]
    fn post_establishment_records_other_than_key_update_are_refused() {
        let (mut client, mut server) = engine_pair();
        complete(&mut client, &mut server);

        let stray = HandshakeRecord::AuthShare {
            attestation: vec![0; 8],
        };
        let wire = stray.to_bytes().unwrap();
        assert!(matches!(
            server.deliver_record(stray, &wire),
            Err(HandshakeError::AlreadyComplete)
        ));
    }

    #[test]
    fn wrong_server_identity_is_rejected() {
        let client_identity = Arc::new(PretrustedIdentity::from_seed([0x01u8; 32]));
        let server_identity = Arc::new(PretrustedIdentity::from_seed([0x02u8; 32]));
        // Client pins a key the server does not hold.
        let wrong = PretrustedIdentity::from_seed([0x03u8; 32]);
        let verifies_server = Arc::new(PretrustedVerifier::new(wrong.public_key()).unwrap());
        let verifies_client =
            Arc::new(PretrustedVerifier::new(client_identity.public_key()).unwrap());

        let mut client = HandshakeEngine::new_client(
            HandshakeConfig::default(),
            client_identity,
            verifies_server,
            CryptoGuard::new(),
        )
        .unwrap();
        let mut server = HandshakeEngine::new_server(
            HandshakeConfig::default(),
            server_identity,
            verifies_client,
            CryptoGuard::new(),
        )
        .unwrap();

        pump(&mut client, &mut server);

        // Deliver the server flight by hand; AuthShare must fail.
        let hello = server.dequeue_transmit(usize::MAX).unwrap().unwrap();
        server.install_tx_key().unwrap();
        let auth = server.dequeue_transmit(usize::MAX).unwrap().unwrap();

        let mut bytes = hello;
        bytes.extend_from_slice(&auth);
        let mut reader = FrameReader::new(&bytes);
        let mut failed = false;
        while !reader.is_empty() {
            let mark = reader.mark();
            let record = HandshakeRecord::decode(&mut reader).unwrap();
            let wire = reader.taken_since(mark);
            match client.deliver_record(record, wire) {
                Ok(_) => {}
                Err(HandshakeError::AuthenticationFailed(_)) => {
                    failed = true;
                    break;
                }
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert!(failed);
    }

    #[test]
    fn key_update_round_rotates_both_directions() {
        let (mut client, mut server) = engine_pair();
        complete(&mut client, &mut server);

        client.deliver_key_update_trigger(true).unwrap();
        // A second trigger while unconfirmed is a no-op.
        client.deliver_key_update_trigger(true).unwrap();

        let events = pump(&mut client, &mut server);
        // Server rotated its rx key and queued its own KeyUpdate.
        assert!(events
            .iter()
            .any(|e| matches!(e, HandshakeEvent::InstallRxKey(_))));

        let events = pump(&mut server, &mut client);
        assert!(events
            .iter()
            .any(|e| matches!(e, HandshakeEvent::InstallRxKey(_))));
        assert_eq!(client.transcript_hash(), server.transcript_hash());
    }

    #[test]
    fn key_update_before_establishment_is_refused() {
        let (mut client, _) = engine_pair();
        assert!(matches!(
            client.deliver_key_update_trigger(true),
            Err(HandshakeError::NotEstablished)
        ));
    }
}
