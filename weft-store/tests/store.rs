mod common;

use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use weft_base::Hash;
use weft_data::{object_hash, HashReference, HashedObject, HashedSet, KeyPair, Mutable};
use weft_store::{SearchParams, StoreError};

use common::{new_store, ChatRoom, GuestBook, SignOp};

#[test]
fn save_and_reload_across_stores_with_validation() -> Result<()> {
    let s1 = new_store("s1");
    let s2 = new_store("s2");

    let pair = KeyPair::generate(&mut rand::rngs::OsRng);
    let identity = Arc::new(pair.identity());
    s1.save(&pair)?;
    s1.save(&*identity)?;

    let room = ChatRoom::new("test", identity.clone());
    let room_hash = s1.save(&room)?;

    // export the literals and import them into the second store, in
    // dependency order
    let room_literal = s1.load_literal(&room_hash)?.expect("room stored");
    for dep in room_literal.literal_dependencies() {
        let literal = s1.load_literal(&dep.hash)?.expect("dependency stored");
        s2.backend().store(&literal, None)?;
    }
    s2.backend().store(&room_literal, None)?;

    let loaded = s2.load(&room_hash, true)?.expect("room imported");
    assert_eq!(loaded.class_name(), "ChatRoom");
    let loaded_room = loaded.as_any().downcast_ref::<ChatRoom>().unwrap();
    assert_eq!(loaded_room.topic, "test");
    assert!(loaded.meta().last_signature().is_some());

    // the author travelled with the room and verifies
    let author = loaded.meta().author.as_ref().unwrap();
    assert_eq!(author.id_hash(), identity.id_hash());
    Ok(())
}

#[test]
fn authored_save_signs_with_stored_key_pair() -> Result<()> {
    let store = new_store("signer");
    let pair = KeyPair::generate(&mut rand::rngs::OsRng);
    store.save(&pair)?;

    // identity without the private half attached
    let identity = Arc::new(weft_data::Identity::from_public_key(*pair.public_key()));
    let room = ChatRoom::new("keys", identity);
    let hash = store.save(&room)?;

    let literal = store.load_literal(&hash)?.unwrap();
    assert!(literal.signature.is_some());
    let reloaded = store.load(&hash, true)?.unwrap();
    // the store attached the key pair it holds
    assert!(reloaded.meta().author.as_ref().unwrap().key_pair().is_some());
    Ok(())
}

#[test]
fn unsigned_authored_save_fails_without_key() {
    let store = new_store("no-key");
    let pair = KeyPair::generate(&mut rand::rngs::OsRng);
    let identity = Arc::new(weft_data::Identity::from_public_key(*pair.public_key()));
    let room = ChatRoom::new("unsignable", identity);
    assert!(matches!(
        store.save(&room),
        Err(StoreError::SigningKeyUnavailable { .. })
    ));
}

#[test]
fn save_refuses_missing_dependencies() {
    let store = new_store("incomplete");
    let ghost_book = GuestBook::new("never saved");
    let target = HashReference::to(&ghost_book).unwrap();
    let op = SignOp::new(target.clone(), "ada", HashedSet::new(), None);
    match store.save(&op) {
        Err(StoreError::MissingDependencies { hashes }) => {
            assert_eq!(hashes, vec![target.hash]);
        }
        other => panic!("expected MissingDependencies, got {other:?}"),
    }
}

#[test]
fn save_refuses_class_mismatch() -> Result<()> {
    let store = new_store("mismatch");
    let book = GuestBook::new("visitors");
    let book_hash = store.save(&book)?;
    // declare the dependency under the wrong class
    let bogus = HashReference::new(book_hash, "Ledger");
    let op = SignOp::new(bogus, "eve", HashedSet::new(), None);
    assert!(matches!(
        store.save(&op),
        Err(StoreError::ClassMismatch { .. })
    ));
    Ok(())
}

#[test]
fn op_headers_chain_over_predecessors() -> Result<()> {
    let store = new_store("headers");
    let book = GuestBook::new("visitors");
    let book_hash = store.save(&book)?;
    let target = HashReference::new(book_hash, GuestBook::CLASS);

    let op1 = SignOp::new(target.clone(), "ada", HashedSet::new(), None);
    let op1_hash = store.save(&op1)?;
    let op2 = SignOp::new(
        target.clone(),
        "grace",
        HashedSet::from_references([HashReference::new(op1_hash, SignOp::CLASS)])?,
        None,
    );
    let op2_hash = store.save(&op2)?;

    let header1 = store.load_op_header(&op1_hash)?.expect("op1 header");
    let header2 = store.load_op_header(&op2_hash)?.expect("op2 header");
    assert!(header1.prev_headers.is_empty());
    assert_eq!(
        header2.prev_headers.get(&op1_hash),
        Some(&header1.header_hash)
    );
    let by_header = store
        .load_op_header_by_header_hash(&header2.header_hash)?
        .expect("lookup by header hash");
    assert_eq!(by_header.op_hash, op2_hash);

    let terminal = store.load_terminal_ops(&book_hash)?.expect("terminal info");
    assert_eq!(terminal.last_op, Some(op2_hash));
    assert_eq!(terminal.terminal_ops, vec![op2_hash]);
    Ok(())
}

#[test]
fn missing_predecessor_header_is_fatal() -> Result<()> {
    let store = new_store("no-prev-header");
    let book = GuestBook::new("visitors");
    let book_hash = store.save(&book)?;
    let target = HashReference::new(book_hash, GuestBook::CLASS);

    // an op literal persisted behind the store's back, without a header
    let rogue = SignOp::new(target.clone(), "ada", HashedSet::new(), None);
    let mut ctx = weft_data::Context::new();
    let rogue_hash = ctx.literalize(&rogue)?;
    store.backend().store(&ctx.literals[&rogue_hash], None)?;

    let op = SignOp::new(
        target,
        "grace",
        HashedSet::from_references([HashReference::new(rogue_hash, SignOp::CLASS)])?,
        None,
    );
    assert!(matches!(
        store.save(&op),
        Err(StoreError::MissingPrevOpHeader { op_hash }) if op_hash == rogue_hash
    ));
    Ok(())
}

#[test]
fn queued_ops_flush_after_save() -> Result<()> {
    let store = new_store("queue");
    let book = GuestBook::new("visitors");
    let book_hash = object_hash(&book)?;
    let op = SignOp::new(
        HashReference::new(book_hash, GuestBook::CLASS),
        "ada",
        HashedSet::new(),
        None,
    );
    book.enqueue_op(Arc::new(op));
    assert!(book.has_queued_ops());

    store.save(&book)?;
    assert!(!book.has_queued_ops());
    let ops = store.load_all_ops(&book_hash)?;
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].class_name(), SignOp::CLASS);

    let by_class = store.load_by_referencing_class(
        SignOp::CLASS,
        "target_object",
        &book_hash,
        &SearchParams::default(),
    )?;
    assert_eq!(by_class.objects.len(), 1);
    let none = store.load_by_referencing_class(
        ChatRoom::CLASS,
        "target_object",
        &book_hash,
        &SearchParams::default(),
    )?;
    assert!(none.objects.is_empty());
    Ok(())
}

#[test]
fn load_by_class_pages_in_order() -> Result<()> {
    let store = new_store("paging");
    let mut hashes: Vec<Hash> = Vec::new();
    for i in 0..5 {
        hashes.push(store.save(&GuestBook::new(&format!("book-{i}")))?);
    }
    hashes.sort();

    let first = store.load_by_class(GuestBook::CLASS, &SearchParams::batch(3))?;
    assert_eq!(first.objects.len(), 3);
    let cursor = first.end_cursor.expect("more pages");
    let second =
        store.load_by_class(GuestBook::CLASS, &SearchParams::batch(3).after(cursor))?;
    assert_eq!(second.objects.len(), 2);
    assert!(second.end_cursor.is_none());

    let seen: Vec<Hash> = first
        .objects
        .iter()
        .chain(second.objects.iter())
        .map(|o| *o.meta().last_hash().unwrap())
        .collect();
    assert_eq!(seen, hashes);
    Ok(())
}

#[test]
fn watch_callbacks_fire_in_order_and_survive_panics() -> Result<()> {
    let store = new_store("watch");
    let calls: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = calls.clone();
    store.watch_class(
        GuestBook::CLASS,
        Arc::new(move |literal| sink.lock().push(format!("class:{}", literal.hash))),
    );
    store.watch_class(
        GuestBook::CLASS,
        Arc::new(|_| panic!("watch callback blew up")),
    );
    let sink = calls.clone();
    store.watch_class(
        GuestBook::CLASS,
        Arc::new(move |literal| sink.lock().push(format!("late:{}", literal.hash))),
    );

    let book = GuestBook::new("watched");
    let book_hash = store.save(&book)?;

    let calls_now = calls.lock().clone();
    assert_eq!(
        calls_now,
        vec![format!("class:{book_hash}"), format!("late:{book_hash}")]
    );

    // reference watches see ops that point at the book
    let sink = calls.clone();
    store.watch_references(
        "target_object",
        book_hash,
        Arc::new(move |literal| sink.lock().push(format!("ref:{}", literal.class_name))),
    );
    let op = SignOp::new(
        HashReference::new(book_hash, GuestBook::CLASS),
        "ada",
        HashedSet::new(),
        None,
    );
    store.save(&op)?;
    assert!(calls.lock().iter().any(|c| c == "ref:SignOp"));
    Ok(())
}

#[test]
fn duplicate_saves_are_noops() -> Result<()> {
    let store = new_store("idempotent");
    let book = GuestBook::new("again");
    let first = store.save(&book)?;
    let saved_before = store.stats().literals_saved();
    let second = store.save(&book)?;
    assert_eq!(first, second);
    assert_eq!(store.stats().literals_saved(), saved_before);
    Ok(())
}
