//! End-to-end integration tests: a full N-node round driven over real
//! loopback TCP sockets, one OS thread per node, exactly as a production
//! deployment would run each node as its own process.

use std::collections::HashSet;
use std::net::{SocketAddr, TcpListener};
use std::thread;
use std::time::Duration;

use anon_shuffle::engine::run_round;
use anon_shuffle::node::NodeConfig;
use anon_shuffle::transport::TcpTransport;
use anon_shuffle::Error;
use rand::rngs::OsRng;

/// Test key size: large enough for PKCS#1 v1.5 padding over our small
/// fixtures, small enough to keygen many of per test quickly.
const TEST_BITS: usize = 512;
const READ_TIMEOUT: Duration = Duration::from_secs(15);

fn free_addr() -> SocketAddr {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
}

/// Runs one full round across `messages.len()` nodes and returns each
/// node's recovered plaintext list (read back from the files `run_round`
/// produced), indexed by node id.
fn run_shuffle(
    round_id: u64,
    max_len: usize,
    messages: Vec<Vec<u8>>,
) -> Vec<std::result::Result<Vec<Vec<u8>>, Error>> {
    let n = messages.len();
    let addrs: Vec<SocketAddr> = (0..n).map(|_| free_addr()).collect();
    let leader_addr = addrs[0];

    let handles: Vec<_> = messages
        .into_iter()
        .enumerate()
        .map(|(i, msg)| {
            let config = NodeConfig {
                id: i as u32,
                key_len_bits: TEST_BITS,
                round_id,
                n_nodes: n as u32,
                my_addr: addrs[i],
                leader_addr,
                prev_addr: addrs[(i + n - 1) % n],
                next_addr: addrs[(i + 1) % n],
                max_len,
                read_timeout: Some(READ_TIMEOUT),
            };
            thread::spawn(move || -> std::result::Result<Vec<Vec<u8>>, Error> {
                let transport = TcpTransport::with_read_timeout(READ_TIMEOUT);
                let mut rng = OsRng;
                let paths = run_round(&config, &transport, &msg, &mut rng)?;
                Ok(paths
                    .into_iter()
                    .map(|p| std::fs::read(p).expect("output file readable"))
                    .collect())
            })
        })
        .collect();

    handles
        .into_iter()
        .map(|h| h.join().expect("node thread should not panic"))
        .collect()
}

#[test]
fn three_node_round_recovers_input_multiset() {
    let messages: Vec<Vec<u8>> = vec![b"alice".to_vec(), b"bob".to_vec(), b"carol".to_vec()];
    let results = run_shuffle(42, 16, messages.clone());

    let outputs: Vec<Vec<Vec<u8>>> = results
        .into_iter()
        .map(|r| r.expect("round should succeed"))
        .collect();

    // every honest node agrees on F and decrypts it identically
    for out in &outputs[1..] {
        assert_eq!(out, &outputs[0]);
    }

    let mut recovered: HashSet<Vec<u8>> = outputs[0].iter().cloned().collect();
    for m in &messages {
        assert!(recovered.remove(m), "missing {:?} from recovered set", m);
    }
    assert!(recovered.is_empty());
}

#[test]
fn two_node_round_is_the_minimal_case() {
    let messages: Vec<Vec<u8>> = vec![b"leader-msg".to_vec(), b"last-msg".to_vec()];
    let results = run_shuffle(7, 32, messages.clone());
    let outputs: Vec<Vec<Vec<u8>>> = results
        .into_iter()
        .map(|r| r.expect("round should succeed"))
        .collect();

    assert_eq!(outputs[0], outputs[1]);
    let recovered: HashSet<Vec<u8>> = outputs[0].iter().cloned().collect();
    let expected: HashSet<Vec<u8>> = messages.into_iter().collect();
    assert_eq!(recovered, expected);
}

#[test]
fn four_node_round_with_identical_plaintexts_still_completes() {
    let messages: Vec<Vec<u8>> = vec![b"hello".to_vec(); 4];
    let results = run_shuffle(99, 8, messages);
    for r in results {
        let out = r.expect("round should succeed even when every plaintext is identical");
        assert_eq!(out.len(), 4);
        for msg in out {
            assert_eq!(msg, b"hello");
        }
    }
}

#[test]
fn empty_and_max_length_messages_round_trip() {
    let messages: Vec<Vec<u8>> = vec![Vec::new(), vec![7u8; 20]];
    let results = run_shuffle(5, 20, messages.clone());
    let outputs: Vec<Vec<Vec<u8>>> = results
        .into_iter()
        .map(|r| r.expect("round should succeed"))
        .collect();
    let recovered: HashSet<Vec<u8>> = outputs[0].iter().cloned().collect();
    let expected: HashSet<Vec<u8>> = messages.into_iter().collect();
    assert_eq!(recovered, expected);
}

#[test]
fn wrong_round_id_in_phase1_join_aborts_with_round_mismatch() {
    use anon_shuffle::codec::{self, WireMessage};
    use anon_shuffle::transport::Transport as _;

    let leader_addr = free_addr();
    let config = NodeConfig {
        id: 0,
        key_len_bits: TEST_BITS,
        round_id: 1,
        n_nodes: 2,
        my_addr: leader_addr,
        leader_addr,
        prev_addr: leader_addr,
        next_addr: leader_addr,
        max_len: 8,
        read_timeout: Some(READ_TIMEOUT),
    };

    let leader_handle = thread::spawn(move || {
        let transport = TcpTransport::with_read_timeout(READ_TIMEOUT);
        let mut rng = OsRng;
        run_round(&config, &transport, b"leader", &mut rng)
    });

    // Forge a Phase 1 join for the round the leader isn't running. The
    // transport's connect retry absorbs the race against the leader's
    // listener bind, so no sleep is needed here.
    let bogus = WireMessage::P1Join {
        id: 1,
        round_id: 2,
        ip: leader_addr.ip(),
        port: leader_addr.port(),
        k1_pub: Vec::new(),
        k2_pub_signed: Vec::new(),
    };
    let payload = codec::encode(&bogus).unwrap();
    TcpTransport::with_read_timeout(READ_TIMEOUT)
        .send(leader_addr, &payload)
        .unwrap();

    let result = leader_handle.join().unwrap();
    assert!(matches!(result.unwrap_err(), Error::RoundMismatch { .. }));
}

#[test]
fn oversized_message_fails_locally_without_touching_the_network() {
    // A single node, talking to nobody: if `run_round` reaches the network
    // before validating `msg` against `max_len`, this call hangs instead of
    // returning promptly with `MessageTooLong`.
    let addr = free_addr();
    let config = NodeConfig {
        id: 0,
        key_len_bits: TEST_BITS,
        round_id: 1,
        n_nodes: 1,
        my_addr: addr,
        leader_addr: addr,
        prev_addr: addr,
        next_addr: addr,
        max_len: 4,
        read_timeout: Some(Duration::from_millis(200)),
    };
    let transport = TcpTransport::with_read_timeout(Duration::from_millis(200));
    let mut rng = OsRng;
    let err = run_round(&config, &transport, b"way too long", &mut rng).unwrap_err();
    assert!(matches!(err, Error::MessageTooLong(12, 4)));
}

/// A [`Transport`] wrapper used only by the middle ring hop in
/// `phase3_dropped_ciphertext_is_detected_by_every_node_in_phase4` below.
/// Every message passes straight through to a real `TcpTransport` except
/// the single Phase 3 ring forward to `next_addr`: that one is opened,
/// has its first ciphertext dropped, and is re-signed and sent in its
/// place, standing in for a node that substitutes or drops an entry
/// mid-shuffle.
struct DroppingTransport {
    inner: TcpTransport,
    own_id: anon_shuffle::node::PartyId,
    next_addr: SocketAddr,
    k1_priv: anon_shuffle::crypto::rsa_ops::PrivateKey,
    k1_pub: anon_shuffle::crypto::rsa_ops::PublicKey,
    sign_rng: std::cell::RefCell<rand_chacha::ChaCha20Rng>,
}

impl anon_shuffle::transport::Transport for DroppingTransport {
    fn send(&self, addr: SocketAddr, bytes: &[u8]) -> anon_shuffle::Result<()> {
        use anon_shuffle::codec::{self, WireMessage};
        use anon_shuffle::crypto::sign;
        use anon_shuffle::transport::Transport as _;
        use std::collections::BTreeMap;

        if addr != self.next_addr {
            return self.inner.send(addr, bytes);
        }

        let mut scratch = BTreeMap::new();
        scratch.insert(self.own_id, self.k1_pub.clone());
        let (signer, payload) =
            sign::verify(&scratch, bytes).expect("own phase-3 forward should verify against its own key");
        assert_eq!(signer, self.own_id);

        let mut items = match codec::decode(&payload).expect("valid wire message") {
            WireMessage::P3Shuffle { items } => items,
            other => panic!("expected P3Shuffle, got {other:?}"),
        };
        assert!(items.len() > 1, "nothing to drop");
        items.remove(0);

        let corrupted = codec::encode(&WireMessage::P3Shuffle { items }).unwrap();
        let blob = sign::sign(
            self.own_id,
            &self.k1_priv,
            &corrupted,
            &mut *self.sign_rng.borrow_mut(),
        )
        .unwrap();
        self.inner.send(addr, &blob)
    }

    fn recv_n(&self, bind_addr: SocketAddr, n: usize) -> anon_shuffle::Result<Vec<(Vec<u8>, SocketAddr)>> {
        use anon_shuffle::transport::Transport as _;
        self.inner.recv_n(bind_addr, n)
    }
}

#[test]
fn phase3_dropped_ciphertext_is_detected_by_every_node_in_phase4() {
    use anon_shuffle::node::SelfKeys;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    let addrs: Vec<SocketAddr> = (0..3).map(|_| free_addr()).collect();
    let leader_addr = addrs[0];
    let round_id = 123;
    let max_len = 16;

    let configs: Vec<NodeConfig> = (0..3)
        .map(|i| NodeConfig {
            id: i as u32,
            key_len_bits: TEST_BITS,
            round_id,
            n_nodes: 3,
            my_addr: addrs[i],
            leader_addr,
            prev_addr: addrs[(i + 2) % 3],
            next_addr: addrs[(i + 1) % 3],
            max_len,
            read_timeout: Some(READ_TIMEOUT),
        })
        .collect();

    let messages: Vec<Vec<u8>> = vec![b"alice".to_vec(), b"bob".to_vec(), b"carol".to_vec()];
    let mut handles = Vec::new();

    // Node 0: honest leader.
    {
        let config = configs[0].clone();
        let msg = messages[0].clone();
        handles.push(thread::spawn(move || {
            let transport = TcpTransport::with_read_timeout(READ_TIMEOUT);
            let mut rng = OsRng;
            run_round(&config, &transport, &msg, &mut rng)
        }));
    }

    // Node 1: the middle ring hop, whose Phase 3 forward is corrupted in
    // flight by `DroppingTransport`. Its K1 keypair is predicted by
    // cloning its seeded rng before `run_round` consumes it, since
    // `SelfKeys::generate` is the first thing `run_round` draws from the
    // rng; the clone and the original therefore produce the same keypair.
    {
        let config = configs[1].clone();
        let msg = messages[1].clone();
        let seed = 0xA11CE_u64;
        let mut node_rng = ChaCha20Rng::seed_from_u64(seed);
        let predicted_keys = SelfKeys::generate(TEST_BITS, &mut node_rng.clone()).expect("keygen");
        let transport = DroppingTransport {
            inner: TcpTransport::with_read_timeout(READ_TIMEOUT),
            own_id: 1,
            next_addr: configs[1].next_addr,
            k1_priv: predicted_keys.k1_priv,
            k1_pub: predicted_keys.k1_pub,
            sign_rng: std::cell::RefCell::new(ChaCha20Rng::seed_from_u64(seed.wrapping_add(1))),
        };
        handles.push(thread::spawn(move || run_round(&config, &transport, &msg, &mut node_rng)));
    }

    // Node 2: honest last node.
    {
        let config = configs[2].clone();
        let msg = messages[2].clone();
        handles.push(thread::spawn(move || {
            let transport = TcpTransport::with_read_timeout(READ_TIMEOUT);
            let mut rng = OsRng;
            run_round(&config, &transport, &msg, &mut rng)
        }));
    }

    for (i, handle) in handles.into_iter().enumerate() {
        let result = handle.join().expect("node thread should not panic");
        let err = result.expect_err(&format!("node {i} should abort after a dropped ciphertext"));
        assert!(
            matches!(err, Error::VerifyFailed(_)),
            "node {i} expected VerifyFailed, got {err:?}"
        );
    }
}
