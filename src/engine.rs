//! The five-phase shuffle protocol engine, the heart of the crate.
//!
//! [`run_round`] drives a single node through Phase 1 (key exchange),
//! Phase 2 (data submission), Phase 3 (the shuffle chain), Phase 4
//! (commit-or-abort verification), and Phase 5 (collective decryption), in
//! that order, returning the recovered plaintexts written to temp files.
//! Each phase is a private function below, split along the same
//! leader/non-leader divergence the protocol itself has: a node's role is
//! fixed for the whole round ([`NodeConfig::is_leader`]), so every phase
//! function branches once on it rather than threading the branch through
//! smaller helpers.
//!
//! Every failure here is fatal: there is no retry path, and no partial
//! output is ever returned. A node's own K2 private key is not touched
//! until [`phase5`], which only runs after [`phase4`] has returned `Ok`,
//! i.e. after every honest node has unanimously voted GO.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::net::SocketAddr;
use std::path::PathBuf;

use rand::seq::SliceRandom;
use rand_core::CryptoRngCore;
use secrecy::ExposeSecret;
use tracing::{error, info, info_span};

use crate::codec::{self, CipherEnvelope, KeyEntry, WireMessage};
use crate::crypto::hash::hash_list;
use crate::crypto::rsa_ops::{self, PrivateKey, PublicKey};
use crate::crypto::sign;
use crate::error::{Error, Result, VerifyFailure};
use crate::node::{self, k1_view, NodeConfig, PartyId, PeerKeyset, SelfKeys};
use crate::transport::{self, Transport};

/// Runs one complete shuffle round for this node and returns the paths of
/// the recovered plaintexts, one file per output, in the anonymized order
/// fixed by Phase 3.
pub fn run_round(
    config: &NodeConfig,
    transport: &impl Transport,
    msg: &[u8],
    rng: &mut impl CryptoRngCore,
) -> Result<Vec<PathBuf>> {
    let round_span = info_span!("shuffle_round", round_id = config.round_id, node_id = config.id);
    let _enter = round_span.enter();
    info!(n_nodes = config.n_nodes, "starting round");

    // Packaged up front, before any network I/O: an oversized message must
    // fail this node locally, never mid-handshake.
    let packaged = node::package(config.max_len, msg).map_err(|e| {
        error!(phase = 0, error = %e, "aborting round before any network I/O");
        e
    })?;

    let self_keys = SelfKeys::generate(config.key_len_bits, rng)?;

    let (peer_keyset, peer_addrs) = phase1(config, transport, &self_keys, rng).map_err(|e| {
        error!(phase = 1, error = %e, "aborting round");
        e
    })?;

    let (own_c_prime, phase2_list) =
        phase2(config, transport, &self_keys, &peer_keyset, &packaged, rng).map_err(|e| {
            error!(phase = 2, error = %e, "aborting round");
            e
        })?;

    let leader_f = phase3(config, transport, &self_keys, &peer_keyset, phase2_list, rng)
        .map_err(|e| {
            error!(phase = 3, error = %e, "aborting round");
            e
        })?;

    let f = phase4(
        config,
        transport,
        &self_keys,
        &peer_keyset,
        &peer_addrs,
        &own_c_prime,
        leader_f,
        rng,
    )
    .map_err(|e| {
        error!(phase = 4, error = %e, "aborting round");
        e
    })?;

    let outputs = phase5(config, transport, &self_keys, &peer_keyset, &peer_addrs, f, rng)
        .map_err(|e| {
            error!(phase = 5, error = %e, "aborting round");
            e
        })?;

    let paths = persist_outputs(config, &outputs)?;
    info!(
        n_outputs = paths.len(),
        lengths = ?outputs.iter().map(Vec::len).collect::<Vec<_>>(),
        "SUCCESSROUND:SHUFFLE"
    );
    Ok(paths)
}

/// Verifies a Phase 1 `(K1_pub, Sign_{K1}(K2_pub))` pair for `id`: parses
/// `K1`, installs it as the sole entry of a scratch keyset, and verifies
/// the K2 signature against that same scratch entry. Preserving this
/// "install K1, then verify K2 against it" order (rather than, say,
/// verifying against a keyset assembled after the whole loop) is called
/// out explicitly in the design notes as load-bearing: verification would
/// otherwise fail with `KeyMissing` for every entry.
fn verify_k2_signature(
    id: PartyId,
    k1_pub_bytes: &[u8],
    k2_pub_signed: &[u8],
) -> Result<(PublicKey, PublicKey)> {
    let k1 = rsa_ops::pub_from_bytes(k1_pub_bytes)?;
    let mut scratch = BTreeMap::new();
    scratch.insert(id, k1.clone());
    let (signer, k2_bytes) = sign::verify(&scratch, k2_pub_signed)?;
    if signer != id {
        return Err(Error::BadSignature(id));
    }
    let k2 = rsa_ops::pub_from_bytes(&k2_bytes)?;
    Ok((k1, k2))
}

/// Phase 1, key exchange. Returns the completed [`PeerKeyset`] and, for
/// the leader only, the peer addresses collected from the Phase 1a joins
/// (needed for the Phase 4/5 broadcasts). Non-leaders get `None`: they
/// never broadcast, only talk to leader/prev/next.
fn phase1(
    config: &NodeConfig,
    transport: &impl Transport,
    self_keys: &SelfKeys,
    rng: &mut impl CryptoRngCore,
) -> Result<(PeerKeyset, Option<Vec<SocketAddr>>)> {
    let _span = info_span!("phase1_key_exchange").entered();

    let mut keyset: PeerKeyset = BTreeMap::new();
    keyset.insert(config.id, (self_keys.k1_pub.clone(), self_keys.k2_pub.clone()));

    if config.is_leader() {
        let frames = transport.recv_n(config.my_addr, (config.n_nodes - 1) as usize)?;

        let mut addrs = Vec::with_capacity(frames.len());
        let mut entries: BTreeMap<PartyId, KeyEntry> = BTreeMap::new();
        entries.insert(
            config.id,
            KeyEntry {
                k1_pub: rsa_ops::pub_to_bytes(&self_keys.k1_pub),
                k2_pub_signed: sign::sign(
                    config.id,
                    &self_keys.k1_priv,
                    &rsa_ops::pub_to_bytes(&self_keys.k2_pub),
                    rng,
                )?,
            },
        );

        for (bytes, _addr) in frames {
            let join = match codec::decode(&bytes)? {
                WireMessage::P1Join {
                    id,
                    round_id,
                    ip,
                    port,
                    k1_pub,
                    k2_pub_signed,
                } => (id, round_id, ip, port, k1_pub, k2_pub_signed),
                _ => return Err(Error::UnexpectedMessage("expected P1Join")),
            };
            let (id, round_id, ip, port, k1_pub, k2_pub_signed) = join;
            if round_id != config.round_id {
                return Err(Error::RoundMismatch {
                    expected: config.round_id,
                    got: round_id,
                });
            }
            let (k1, k2) = verify_k2_signature(id, &k1_pub, &k2_pub_signed)?;
            keyset.insert(id, (k1, k2));
            addrs.push(SocketAddr::new(ip, port));
            entries.insert(
                id,
                KeyEntry {
                    k1_pub,
                    k2_pub_signed,
                },
            );
        }

        let distribute = WireMessage::P1Distribute {
            round_id: config.round_id,
            keys: entries,
        };
        let payload = codec::encode(&distribute)?;
        for addr in &addrs {
            transport.send(*addr, &payload)?;
        }

        if keyset.len() != config.n_nodes as usize {
            return Err(Error::IncompleteKeyset {
                have: keyset.len(),
                expected: config.n_nodes as usize,
            });
        }
        Ok((keyset, Some(addrs)))
    } else {
        let join = WireMessage::P1Join {
            id: config.id,
            round_id: config.round_id,
            ip: config.my_addr.ip(),
            port: config.my_addr.port(),
            k1_pub: rsa_ops::pub_to_bytes(&self_keys.k1_pub),
            k2_pub_signed: sign::sign(
                config.id,
                &self_keys.k1_priv,
                &rsa_ops::pub_to_bytes(&self_keys.k2_pub),
                rng,
            )?,
        };
        transport::unsigned_send(transport, config.leader_addr, &join)?;

        let mut frames = transport.recv_n(config.my_addr, 1)?;
        let (bytes, _addr) = frames.remove(0);
        let (round_id, entries) = match codec::decode(&bytes)? {
            WireMessage::P1Distribute { round_id, keys } => (round_id, keys),
            _ => return Err(Error::UnexpectedMessage("expected P1Distribute")),
        };
        if round_id != config.round_id {
            return Err(Error::RoundMismatch {
                expected: config.round_id,
                got: round_id,
            });
        }
        for (id, entry) in entries {
            if id == config.id {
                continue;
            }
            let (k1, k2) = verify_k2_signature(id, &entry.k1_pub, &entry.k2_pub_signed)?;
            keyset.insert(id, (k1, k2));
        }
        if keyset.len() != config.n_nodes as usize {
            return Err(Error::IncompleteKeyset {
                have: keyset.len(),
                expected: config.n_nodes as usize,
            });
        }
        Ok((keyset, None))
    }
}

/// Phase 2, data submission. Computes this node's layered ciphertext and,
/// for the leader, the initial Phase 3 shuffle list (peer submissions in
/// arrival order, with the leader's own appended last).
fn phase2(
    config: &NodeConfig,
    transport: &impl Transport,
    self_keys: &SelfKeys,
    peer_keyset: &PeerKeyset,
    packaged: &[u8],
    rng: &mut impl CryptoRngCore,
) -> Result<(Vec<u8>, Vec<CipherEnvelope>)> {
    let _span = info_span!("phase2_data_submission").entered();

    // Descending id order: the last key applied (id 0) ends up outermost,
    // matching the ascending peel order Phase 3 and Phase 5 rely on.
    let k2_desc: Vec<PublicKey> = (0..config.n_nodes)
        .rev()
        .map(|id| peer_keyset[&id].1.clone())
        .collect();
    let k1_desc: Vec<PublicKey> = (0..config.n_nodes)
        .rev()
        .map(|id| peer_keyset[&id].0.clone())
        .collect();

    let c_prime = rsa_ops::layer_encrypt(&k2_desc, packaged, rng)?;
    let c_outer = rsa_ops::layer_encrypt(&k1_desc, &c_prime, rng)?;

    if config.is_leader() {
        let k1_keys = k1_view(peer_keyset);
        let msgs = transport::verified_recv_n(
            transport,
            config.my_addr,
            (config.n_nodes - 1) as usize,
            &k1_keys,
        )?;
        let mut list = Vec::with_capacity(config.n_nodes as usize);
        for (_signer, decoded) in msgs {
            match decoded {
                WireMessage::P2Cipher { round_id, cipher } => {
                    if round_id != config.round_id {
                        return Err(Error::RoundMismatch {
                            expected: config.round_id,
                            got: round_id,
                        });
                    }
                    list.push(CipherEnvelope {
                        round_id,
                        ctext: cipher,
                    });
                }
                _ => return Err(Error::UnexpectedMessage("expected P2Cipher")),
            }
        }
        list.push(CipherEnvelope {
            round_id: config.round_id,
            ctext: c_outer,
        });
        Ok((c_prime, list))
    } else {
        transport::signed_send(
            transport,
            config.leader_addr,
            config.id,
            &self_keys.k1_priv,
            &WireMessage::P2Cipher {
                round_id: config.round_id,
                cipher: c_outer,
            },
            rng,
        )?;
        Ok((c_prime, Vec::new()))
    }
}

/// Phase 3, the shuffle chain. Every node peels one K1 layer, permutes,
/// and forwards around the ring `0 -> 1 -> ... -> N-1 -> leader`. Returns
/// `Some(F)` for the leader (who alone receives the closed ring's output),
/// `None` for everyone else.
fn phase3(
    config: &NodeConfig,
    transport: &impl Transport,
    self_keys: &SelfKeys,
    peer_keyset: &PeerKeyset,
    phase2_list: Vec<CipherEnvelope>,
    rng: &mut impl CryptoRngCore,
) -> Result<Option<Vec<CipherEnvelope>>> {
    let _span = info_span!("phase3_shuffle").entered();
    let k1_keys = k1_view(peer_keyset);

    let incoming = if config.is_leader() {
        phase2_list
    } else {
        let msgs = transport::verified_recv_n(transport, config.my_addr, 1, &k1_keys)?;
        let (_signer, decoded) = msgs
            .into_iter()
            .next()
            .expect("recv_n(1) returns exactly one message");
        match decoded {
            WireMessage::P3Shuffle { items } => items,
            _ => return Err(Error::UnexpectedMessage("expected P3Shuffle")),
        }
    };

    for item in &incoming {
        if item.round_id != config.round_id {
            return Err(Error::RoundMismatch {
                expected: config.round_id,
                got: item.round_id,
            });
        }
    }

    let mut peeled: Vec<Vec<u8>> = incoming
        .iter()
        .map(|item| rsa_ops::decrypt(&self_keys.k1_priv, &item.ctext))
        .collect::<Result<_>>()?;
    peeled.shuffle(rng);

    let outgoing: Vec<CipherEnvelope> = peeled
        .into_iter()
        .map(|ctext| CipherEnvelope {
            round_id: config.round_id,
            ctext,
        })
        .collect();

    let forward_to = if config.is_last() {
        config.leader_addr
    } else {
        config.next_addr
    };
    transport::signed_send(
        transport,
        forward_to,
        config.id,
        &self_keys.k1_priv,
        &WireMessage::P3Shuffle { items: outgoing },
        rng,
    )?;

    if config.is_leader() {
        let msgs = transport::verified_recv_n(transport, config.my_addr, 1, &k1_keys)?;
        let (_signer, decoded) = msgs
            .into_iter()
            .next()
            .expect("recv_n(1) returns exactly one message");
        let final_items = match decoded {
            WireMessage::P3Shuffle { items } => items,
            _ => return Err(Error::UnexpectedMessage("expected final P3Shuffle")),
        };
        for item in &final_items {
            if item.round_id != config.round_id {
                return Err(Error::RoundMismatch {
                    expected: config.round_id,
                    got: item.round_id,
                });
            }
        }
        Ok(Some(final_items))
    } else {
        Ok(None)
    }
}

/// Phase 4, commit-or-abort verification. The leader broadcasts `F`;
/// every node (including the leader) checks its own `C'` is present,
/// computes `hash_list(F)`, and casts a signed GO/NO-GO vote. Vote blobs
/// are relayed through the leader unopened (never decoded, only
/// collected and rebroadcast) so every node verifies the exact bytes its
/// peers signed.
fn phase4(
    config: &NodeConfig,
    transport: &impl Transport,
    self_keys: &SelfKeys,
    peer_keyset: &PeerKeyset,
    peer_addrs: &Option<Vec<SocketAddr>>,
    own_c_prime: &[u8],
    leader_f: Option<Vec<CipherEnvelope>>,
    rng: &mut impl CryptoRngCore,
) -> Result<Vec<CipherEnvelope>> {
    let _span = info_span!("phase4_verify").entered();
    let k1_keys = k1_view(peer_keyset);

    let f: Vec<CipherEnvelope> = if config.is_leader() {
        let f = leader_f.expect("leader always holds F after phase3");
        let addrs = peer_addrs
            .as_ref()
            .expect("leader collected peer addresses in phase1");
        for addr in addrs {
            transport::signed_send(
                transport,
                *addr,
                config.id,
                &self_keys.k1_priv,
                &WireMessage::P4FinalSet { items: f.clone() },
                rng,
            )?;
        }
        f
    } else {
        let msgs = transport::verified_recv_n(transport, config.my_addr, 1, &k1_keys)?;
        let (_signer, decoded) = msgs
            .into_iter()
            .next()
            .expect("recv_n(1) returns exactly one message");
        match decoded {
            WireMessage::P4FinalSet { items } => items,
            _ => return Err(Error::UnexpectedMessage("expected P4FinalSet")),
        }
    };

    let my_env = CipherEnvelope {
        round_id: config.round_id,
        ctext: own_c_prime.to_vec(),
    };
    let go = f.contains(&my_env);
    if !go {
        error!(node_id = config.id, "own inner ciphertext missing from agreed final set");
    }
    let f_bytes: Vec<Vec<u8>> = f.iter().map(|e| codec::canonical_bytes(e)).collect();
    let h = hash_list(&f_bytes);

    let own_vote_msg = WireMessage::P4Vote {
        id: config.id,
        round_id: config.round_id,
        go,
        hash: h,
    };
    let own_vote_blob = sign::sign(
        config.id,
        &self_keys.k1_priv,
        &codec::encode(&own_vote_msg)?,
        rng,
    )?;

    let vote_blobs: Vec<Vec<u8>> = if config.is_leader() {
        let frames = transport.recv_n(config.my_addr, (config.n_nodes - 1) as usize)?;
        let mut blobs: Vec<Vec<u8>> = frames.into_iter().map(|(bytes, _addr)| bytes).collect();
        blobs.push(own_vote_blob);
        let addrs = peer_addrs
            .as_ref()
            .expect("leader collected peer addresses in phase1");
        let vote_set = WireMessage::P4VoteSet {
            votes: blobs.clone(),
        };
        for addr in addrs {
            transport::signed_send(transport, *addr, config.id, &self_keys.k1_priv, &vote_set, rng)?;
        }
        blobs
    } else {
        transport.send(config.leader_addr, &own_vote_blob)?;
        let msgs = transport::verified_recv_n(transport, config.my_addr, 1, &k1_keys)?;
        let (_signer, decoded) = msgs
            .into_iter()
            .next()
            .expect("recv_n(1) returns exactly one message");
        match decoded {
            WireMessage::P4VoteSet { votes } => votes,
            _ => return Err(Error::UnexpectedMessage("expected P4VoteSet")),
        }
    };

    if vote_blobs.len() != config.n_nodes as usize {
        return Err(Error::IncompleteKeyset {
            have: vote_blobs.len(),
            expected: config.n_nodes as usize,
        });
    }

    for blob in &vote_blobs {
        let (signer, payload) = sign::verify(&k1_keys, blob)?;
        match codec::decode(&payload)? {
            WireMessage::P4Vote {
                id,
                round_id,
                go: peer_go,
                hash,
            } => {
                if id != signer {
                    return Err(Error::BadSignature(signer));
                }
                if round_id != config.round_id {
                    return Err(Error::RoundMismatch {
                        expected: config.round_id,
                        got: round_id,
                    });
                }
                if hash != h {
                    return Err(Error::VerifyFailed(VerifyFailure::HashMismatch));
                }
                if !peer_go {
                    if id == config.id {
                        return Err(Error::VerifyFailed(VerifyFailure::OwnCiphertextMissing));
                    }
                    return Err(Error::VerifyFailed(VerifyFailure::PeerVotedNo(id)));
                }
            }
            _ => return Err(Error::UnexpectedMessage("expected P4Vote")),
        }
    }

    Ok(f)
}

/// Phase 5, collective decryption. K2 private keys are revealed only now,
/// after every honest node has committed to `F` in Phase 4. Each `C'` in
/// `F` is decrypted under the revealed keys in ascending id order, the
/// exact inverse of Phase 2's descending encryption order, then unpacked
/// back to its original plaintext.
fn phase5(
    config: &NodeConfig,
    transport: &impl Transport,
    self_keys: &SelfKeys,
    peer_keyset: &PeerKeyset,
    peer_addrs: &Option<Vec<SocketAddr>>,
    f: Vec<CipherEnvelope>,
    rng: &mut impl CryptoRngCore,
) -> Result<Vec<Vec<u8>>> {
    let _span = info_span!("phase5_decrypt").entered();
    let k1_keys = k1_view(peer_keyset);

    let own_reveal_msg = WireMessage::P5Reveal {
        id: config.id,
        round_id: config.round_id,
        k2_priv: rsa_ops::priv_to_bytes(&self_keys.k2_priv).to_vec(),
    };
    let own_reveal_blob = sign::sign(
        config.id,
        &self_keys.k1_priv,
        &codec::encode(&own_reveal_msg)?,
        rng,
    )?;

    let reveal_blobs: Vec<Vec<u8>> = if config.is_leader() {
        let frames = transport.recv_n(config.my_addr, (config.n_nodes - 1) as usize)?;
        let mut blobs: Vec<Vec<u8>> = frames.into_iter().map(|(bytes, _addr)| bytes).collect();
        blobs.push(own_reveal_blob);
        let addrs = peer_addrs
            .as_ref()
            .expect("leader collected peer addresses in phase1");
        let reveal_set = WireMessage::P5RevealSet {
            reveals: blobs.clone(),
        };
        for addr in addrs {
            transport::signed_send(
                transport,
                *addr,
                config.id,
                &self_keys.k1_priv,
                &reveal_set,
                rng,
            )?;
        }
        blobs
    } else {
        transport.send(config.leader_addr, &own_reveal_blob)?;
        let msgs = transport::verified_recv_n(transport, config.my_addr, 1, &k1_keys)?;
        let (_signer, decoded) = msgs
            .into_iter()
            .next()
            .expect("recv_n(1) returns exactly one message");
        match decoded {
            WireMessage::P5RevealSet { reveals } => reveals,
            _ => return Err(Error::UnexpectedMessage("expected P5RevealSet")),
        }
    };

    if reveal_blobs.len() != config.n_nodes as usize {
        return Err(Error::IncompleteKeyset {
            have: reveal_blobs.len(),
            expected: config.n_nodes as usize,
        });
    }

    let mut k2_privs: BTreeMap<PartyId, PrivateKey> = BTreeMap::new();
    for blob in &reveal_blobs {
        let (signer, payload) = sign::verify(&k1_keys, blob)?;
        match codec::decode(&payload)? {
            WireMessage::P5Reveal {
                id,
                round_id,
                k2_priv,
            } => {
                if id != signer {
                    return Err(Error::BadSignature(signer));
                }
                if round_id != config.round_id {
                    return Err(Error::RoundMismatch {
                        expected: config.round_id,
                        got: round_id,
                    });
                }
                let secret = rsa_ops::priv_from_bytes(&k2_priv)?;
                k2_privs.insert(id, secret.expose_secret().clone());
            }
            _ => return Err(Error::UnexpectedMessage("expected P5Reveal")),
        }
    }

    // Ascending id order: the inverse of phase2's descending encryption.
    let mut outputs = Vec::with_capacity(f.len());
    for item in &f {
        let ordered_keys: Vec<&PrivateKey> = (0..config.n_nodes).map(|id| &k2_privs[&id]).collect();
        let plain = rsa_ops::layer_decrypt(ordered_keys, &item.ctext)?;
        outputs.push(node::unpackage(config.max_len, &plain)?);
    }

    Ok(outputs)
}

fn persist_outputs(config: &NodeConfig, outputs: &[Vec<u8>]) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::with_capacity(outputs.len());
    for (i, plain) in outputs.iter().enumerate() {
        let mut file = tempfile::Builder::new()
            .prefix(&format!("shuffle-round-{}-out-{}-", config.round_id, i))
            .tempfile()
            .map_err(Error::OutputWriteFailed)?;
        file.write_all(plain).map_err(Error::OutputWriteFailed)?;
        let (_, path) = file
            .keep()
            .map_err(|persist_err| Error::OutputWriteFailed(persist_err.error))?;
        paths.push(path);
    }
    Ok(paths)
}
