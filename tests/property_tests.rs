//! Property-based and scenario tests for the SQLChain core
//!
//! These tests drive whole nodes through the public API and check that chain,
//! pool, indexes and SQL effects stay consistent across forks.

use proptest::prelude::*;
use sqlchain_core::blockchain::{AddState, Blockchain};
use sqlchain_core::config::{ConsensusConfig, PowSettings};
use sqlchain_core::consensus::{pow, target_bits, transaction_limits, Block, ConsensusError};
use sqlchain_core::crypto::{hash_bytes, Hash, PrivateKey};
use sqlchain_core::node::{IngestOutcome, Node, NodeError};
use sqlchain_core::storage::{ChainError, ChainStore, MemoryStore};
use sqlchain_core::transactions::TxError;
use sqlchain_core::validation::{RecordingExecutor, SqlEvent, Transaction, TxInput, TxOutput};
use std::sync::Arc;

fn easy() -> ConsensusConfig {
    ConsensusConfig {
        settings: PowSettings {
            complexity_bits: 2,
            complexity_bits_step2: 2,
            complexity_step_height: 1000,
            min_tx_per_block: 1,
            max_tx_per_block: 10,
            minimum_block_building_time_secs: 0,
            max_nonce: 1_000_000,
        },
        ..ConsensusConfig::default()
    }
}

struct TestNode {
    node: Node,
    executor: Arc<RecordingExecutor>,
}

fn new_node(key: &PrivateKey) -> TestNode {
    let executor = Arc::new(RecordingExecutor::new());
    let node = Node::new(
        Arc::new(MemoryStore::new()),
        executor.clone(),
        easy(),
        Some(key.public_key().pubkey_hash()),
    );
    TestNode { node, executor }
}

/// Two nodes sharing one genesis block
fn two_nodes(key: &PrivateKey) -> (TestNode, TestNode) {
    let a = new_node(key);
    let b = new_node(key);
    a.node.init_blockchain(&key.public_key().pubkey_hash()).unwrap();
    let genesis = a.node.blockchain().get_top_block().unwrap();
    b.node.init_blockchain_from_genesis(&genesis).unwrap();
    (a, b)
}

fn sql_tx(n: &TestNode, key: &PrivateKey, query: &str) -> Transaction {
    let sql = n.node.transactions().prepare_sql_update(query).unwrap();
    Transaction::signed(key, vec![], vec![], Some(sql))
}

fn mint(n: &TestNode) -> Block {
    let hash = n.node.try_to_make_block(None).unwrap().unwrap();
    n.node.blockchain().get_block(&hash).unwrap()
}

fn submit_and_mint(n: &TestNode, tx: &Transaction) -> Block {
    n.node.received_new_transaction(tx).unwrap();
    mint(n)
}

fn stub_block(prev: &Block, tag: &str) -> Block {
    let mut b = Block::new(prev.hash, prev.height + 1, 0, vec![]);
    b.hash = hash_bytes(tag.as_bytes());
    b
}

// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Links always point at the latest child and only tips can be unlinked
    #[test]
    fn prop_chain_linkage(len in 2usize..12, popped in 0usize..12) {
        let chain = ChainStore::new(Arc::new(MemoryStore::new()));
        let hashes: Vec<Hash> = (0..len as u64).map(|i| hash_bytes(&i.to_le_bytes())).collect();
        let mut prev = Hash::zero();
        for h in &hashes {
            chain.add_to_chain(h, &prev).unwrap();
            prev = *h;
        }

        let popped = popped.min(len - 1);
        for h in hashes.iter().rev().take(popped) {
            chain.remove_from_chain(h).unwrap();
        }
        let kept = &hashes[..len - popped];

        for pair in kept.windows(2) {
            let link = chain.get_location_in_chain(&pair[0]).unwrap().unwrap();
            prop_assert_eq!(link.next, pair[1]);
            let is_not_tip = matches!(chain.remove_from_chain(&pair[0]), Err(ChainError::NotTip(_)));
            prop_assert!(is_not_tip);
        }
        let tip = chain.get_location_in_chain(&kept[kept.len() - 1]).unwrap().unwrap();
        prop_assert!(tip.next.is_zero());
        for h in &hashes[len - popped..] {
            prop_assert!(!chain.block_in_chain(h).unwrap());
        }

        // a re-added child replaces the popped one
        if popped > 0 {
            let fresh = hash_bytes(b"fresh");
            chain.add_to_chain(&fresh, &kept[kept.len() - 1]).unwrap();
            let link = chain.get_location_in_chain(&kept[kept.len() - 1]).unwrap().unwrap();
            prop_assert_eq!(link.next, fresh);
        }
    }

    /// Flipping any bit of the parent hash breaks the seal
    #[test]
    fn prop_prev_hash_bit_flip_breaks_pow(bit in 0usize..256) {
        let settings = easy().settings;
        let key = PrivateKey::generate();
        let coinbase = Transaction::coinbase(10, key.public_key().pubkey_hash(), 1);
        let mut block = Block::new(hash_bytes(b"parent"), 1, 7, vec![coinbase]);
        pow::seal(&mut block, &settings).unwrap();
        prop_assert!(pow::validate(&block, &settings).unwrap());

        block.prev_hash.0[bit / 8] ^= 1 << (bit % 8);
        prop_assert!(!pow::validate(&block, &settings).unwrap());
    }

    /// The minimum ramps up with height and the maximum never moves
    #[test]
    fn prop_transaction_limits(height in 0u64..5_000, min in 1u64..100, extra in 0u64..100) {
        let settings = PowSettings { min_tx_per_block: min, max_tx_per_block: min + extra, ..PowSettings::default() };
        let (lo, hi) = transaction_limits(&settings, height);
        prop_assert_eq!(lo, height.clamp(1, min));
        prop_assert_eq!(hi, min + extra);
        prop_assert!(lo <= hi);
    }

    /// Difficulty switches exactly at the step height
    #[test]
    fn prop_difficulty_step(height in 0u64..3_000) {
        let settings = PowSettings::default();
        let expected = if height >= settings.complexity_step_height {
            settings.complexity_bits_step2
        } else {
            settings.complexity_bits
        };
        prop_assert_eq!(target_bits(&settings, height), expected);
    }

    /// The highest branch wins, an equal one never displaces the tip
    #[test]
    fn prop_fork_choice_by_height(main_len in 1usize..6, side_len in 1usize..6) {
        let chain = Blockchain::new(Arc::new(MemoryStore::new()));
        let mut genesis = Block::new(Hash::zero(), 0, 0, vec![]);
        genesis.hash = hash_bytes(b"genesis");
        chain.create_genesis(&genesis).unwrap();

        let mut prev = genesis.clone();
        for i in 0..main_len {
            let b = stub_block(&prev, &format!("main{i}"));
            prop_assert_eq!(chain.add_block(&b).unwrap(), AddState::AddedToTop);
            prev = b;
        }
        let main_tip = prev.hash;

        let mut prev = genesis;
        let mut side_tip = Hash::zero();
        for i in 0..side_len {
            let b = stub_block(&prev, &format!("side{i}"));
            chain.add_block(&b).unwrap();
            side_tip = b.hash;
            prev = b;
        }

        let expected = if side_len > main_len { side_tip } else { main_tip };
        prop_assert_eq!(chain.get_top_hash().unwrap(), expected);
        prop_assert_eq!(chain.get_best_height().unwrap() as usize, main_len.max(side_len));
    }

    /// Two pending transactions never spend the same output
    #[test]
    fn prop_pool_rejects_double_spend(first in 1u64..10, second in 1u64..10) {
        let key = PrivateKey::generate();
        let pkh = key.public_key().pubkey_hash();
        let n = new_node(&key);
        n.node.init_blockchain(&pkh).unwrap();
        let coinbase = n.node.blockchain().get_top_block().unwrap().transactions[0].clone();

        let other = PrivateKey::generate().public_key().pubkey_hash();
        let spend = |value: u64| {
            Transaction::signed(
                &key,
                vec![TxInput { tx_id: coinbase.id, out_index: 0 }],
                vec![
                    TxOutput { value, dest: other },
                    TxOutput { value: 10 - value, dest: pkh },
                ],
                None,
            )
        };
        let a = spend(first);
        let b = spend(second);
        prop_assume!(a.id != b.id);

        n.node.received_new_transaction(&a).unwrap();
        let refused = n.node.received_new_transaction(&b);
        let is_pool_conflict = matches!(
            refused,
            Err(NodeError::Consensus(ConsensusError::Tx(TxError::PoolConflict(..))))
        );
        prop_assert!(is_pool_conflict);
        prop_assert_eq!(n.node.transactions().get_unapproved_count().unwrap(), 1);
    }
}

// ============================================================================
// CHAIN SCENARIOS
// ============================================================================

#[test]
fn test_blocks_link_to_their_parent() {
    let key = PrivateKey::generate();
    let n = new_node(&key);
    n.node.init_blockchain(&key.public_key().pubkey_hash()).unwrap();
    for table in ["a", "b", "c"] {
        submit_and_mint(&n, &sql_tx(&n, &key, &format!("CREATE TABLE {table} (id int)")));
    }

    let blocks: Vec<Block> = n.node.blockchain().iter().unwrap().map(|b| b.unwrap()).collect();
    assert_eq!(blocks.len(), 4);
    for pair in blocks.windows(2) {
        assert_eq!(pair[0].prev_hash, pair[1].hash);
        assert_eq!(pair[0].height, pair[1].height + 1);
    }
    assert!(blocks[3].is_genesis());
}

#[test]
fn test_peer_block_with_flipped_parent_bit_is_rejected() {
    let key = PrivateKey::generate();
    let (a, b) = two_nodes(&key);
    let block = submit_and_mint(&a, &sql_tx(&a, &key, "CREATE TABLE t (id int)"));

    let mut flipped = block.clone();
    flipped.prev_hash.0[0] ^= 1;
    assert!(matches!(
        b.node.minter().verify_block(&flipped, true),
        Err(ConsensusError::InvalidHash)
    ));
    assert_eq!(b.node.received_full_block_from_other_node(&flipped).unwrap(), IngestOutcome::NoPrev);

    let mut resealed = block.clone();
    resealed.nonce = resealed.nonce.wrapping_add(1);
    match b.node.received_full_block_from_other_node(&resealed).unwrap() {
        IngestOutcome::Rejected(reason) => assert_eq!(reason, "Block hash is not valid"),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(
        b.node.received_full_block_from_other_node(&block).unwrap(),
        IngestOutcome::Added(AddState::AddedToTop)
    );
    assert_eq!(b.node.blockchain().get_best_height().unwrap(), 1);
}

// ============================================================================
// REORGANIZATION SCENARIOS
// ============================================================================

#[test]
fn test_reorg_moves_sql_and_pending_state() {
    let key = PrivateKey::generate();
    let pkh = key.public_key().pubkey_hash();
    let (a, b) = two_nodes(&key);

    let create = sql_tx(&a, &key, "CREATE TABLE t (id int)");
    submit_and_mint(&a, &create);
    let insert = sql_tx(&a, &key, "INSERT INTO t VALUES id=1");
    assert_eq!(insert.sql_base(), Some(create.id));
    submit_and_mint(&a, &insert);
    assert_eq!(a.node.transactions().refs().get("t:1").unwrap(), Some(insert.id));
    assert_eq!(a.node.transactions().utxo().get_address_balance(&pkh).unwrap(), 30);

    // a longer competing branch
    let mut branch = Vec::new();
    for table in ["u", "v", "w"] {
        branch.push(submit_and_mint(&b, &sql_tx(&b, &key, &format!("CREATE TABLE {table} (id int)"))));
    }

    a.executor.clear();
    let outcomes: Vec<IngestOutcome> = branch
        .iter()
        .map(|block| a.node.received_full_block_from_other_node(block).unwrap())
        .collect();
    assert_eq!(
        outcomes,
        vec![
            IngestOutcome::Added(AddState::AddedToParallel),
            IngestOutcome::Added(AddState::AddedToParallel),
            IngestOutcome::Added(AddState::AddedToParallelTop),
        ]
    );
    assert_eq!(a.node.blockchain().get_top_hash().unwrap(), branch[2].hash);

    // undone newest first, new branch applied, canceled work executed again
    assert_eq!(
        a.executor.events(),
        vec![
            SqlEvent::RolledBack("INSERT INTO t VALUES id=1".into()),
            SqlEvent::RolledBack("CREATE TABLE t (id int)".into()),
            SqlEvent::Executed("CREATE TABLE u (id int)".into()),
            SqlEvent::Executed("CREATE TABLE v (id int)".into()),
            SqlEvent::Executed("CREATE TABLE w (id int)".into()),
            SqlEvent::Executed("CREATE TABLE t (id int)".into()),
            SqlEvent::Executed("INSERT INTO t VALUES id=1".into()),
        ]
    );

    let tx = a.node.transactions();
    assert_eq!(tx.refs().get("t:1").unwrap(), None);
    assert_eq!(tx.refs().get("t:*").unwrap(), None);
    assert_eq!(tx.refs().get("u:*").unwrap(), Some(branch[0].transactions[0].id));
    assert!(tx.get_if_unapproved_exists(&create.id).unwrap().is_some());
    assert!(tx.get_if_unapproved_exists(&insert.id).unwrap().is_some());
    assert_eq!(tx.utxo().get_address_balance(&pkh).unwrap(), 40);

    // the canceled pair is minted again on top of the winning branch
    a.executor.clear();
    let again = mint(&a);
    assert_eq!(again.height, 4);
    assert_eq!(again.regular_transactions().count(), 2);
    assert!(a.executor.events().is_empty());
    assert_eq!(tx.refs().get("t:1").unwrap(), Some(insert.id));
    assert_eq!(tx.get_unapproved_count().unwrap(), 0);
}

#[test]
fn test_reorg_unwinds_pending_work_on_undone_blocks() {
    let key = PrivateKey::generate();
    let (a, b) = two_nodes(&key);

    let create = sql_tx(&a, &key, "CREATE TABLE t (id int)");
    submit_and_mint(&a, &create);
    let insert = sql_tx(&a, &key, "INSERT INTO t VALUES id=1");
    assert_eq!(insert.sql_base(), Some(create.id));
    a.node.received_new_transaction(&insert).unwrap();

    let branch: Vec<Block> = ["u", "v"]
        .iter()
        .map(|table| submit_and_mint(&b, &sql_tx(&b, &key, &format!("CREATE TABLE {table} (id int)"))))
        .collect();

    a.executor.clear();
    for block in &branch {
        a.node.received_full_block_from_other_node(block).unwrap();
    }
    assert_eq!(a.node.blockchain().get_top_hash().unwrap(), branch[1].hash);

    // the pending insert is unwound before the table it writes to
    assert_eq!(
        a.executor.events(),
        vec![
            SqlEvent::RolledBack("INSERT INTO t VALUES id=1".into()),
            SqlEvent::RolledBack("CREATE TABLE t (id int)".into()),
            SqlEvent::Executed("CREATE TABLE u (id int)".into()),
            SqlEvent::Executed("CREATE TABLE v (id int)".into()),
            SqlEvent::Executed("CREATE TABLE t (id int)".into()),
            SqlEvent::Executed("INSERT INTO t VALUES id=1".into()),
        ]
    );
    let tx = a.node.transactions();
    assert_eq!(tx.get_unapproved_count().unwrap(), 2);
    assert!(tx.get_if_unapproved_exists(&insert.id).unwrap().is_some());

    let again = mint(&a);
    let ids: Vec<Hash> = again.regular_transactions().map(|tx| tx.id).collect();
    assert_eq!(ids, vec![create.id, insert.id]);
}

#[test]
fn test_dependent_pair_survives_drop_and_remint() {
    let key = PrivateKey::generate();
    let pkh = key.public_key().pubkey_hash();
    let n = new_node(&key);
    n.node.init_blockchain(&pkh).unwrap();

    let create = sql_tx(&n, &key, "CREATE TABLE t (id int)");
    n.node.received_new_transaction(&create).unwrap();
    let insert = sql_tx(&n, &key, "INSERT INTO t VALUES id=1");
    n.node.received_new_transaction(&insert).unwrap();

    let block = mint(&n);
    let ids: Vec<Hash> = block.regular_transactions().map(|tx| tx.id).collect();
    assert_eq!(ids, vec![create.id, insert.id]);
    assert_eq!(
        n.executor.events(),
        vec![
            SqlEvent::Executed("CREATE TABLE t (id int)".into()),
            SqlEvent::Executed("INSERT INTO t VALUES id=1".into()),
        ]
    );
    let before = n.node.get_node_state().unwrap();

    let dropped = n.node.drop_block().unwrap();
    assert_eq!(dropped.hash, block.hash);
    let tx = n.node.transactions();
    assert_eq!(tx.refs().get("t:*").unwrap(), None);
    assert_eq!(tx.refs().get("t:1").unwrap(), None);
    assert_eq!(tx.utxo().get_address_balance(&pkh).unwrap(), 10);
    let pending = tx.get_if_unapproved_exists(&insert.id).unwrap().unwrap();
    assert_eq!(pending.sql_base(), Some(create.id));
    assert_eq!(tx.get_unapproved_count().unwrap(), 2);

    n.executor.clear();
    let again = mint(&n);
    assert_eq!(again.height, 1);
    assert!(n.executor.events().is_empty());
    assert_eq!(n.node.get_node_state().unwrap(), before);
    assert_eq!(tx.refs().get("t:1").unwrap(), Some(insert.id));
}
