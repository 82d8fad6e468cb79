//! Router-level behavior over the in-process transport: deterministic
//! shard assignment, targeted broadcast, lifecycle callback accounting.

use bytes::Bytes;
use riptide_core::inproc::{self, InprocPipe};
use riptide_core::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

async fn wait_for(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn join(router: &Arc<Router>) -> (InprocPipe, JoinHandle<Result<()>>) {
    join_with_query(router, HashMap::new())
}

fn join_with_query(
    router: &Arc<Router>,
    query_paras: HashMap<String, String>,
) -> (InprocPipe, JoinHandle<Result<()>>) {
    let (local, remote) = inproc::pair();
    let (sink, stream) = local.split();
    let router = router.clone();
    let handle = tokio::spawn(async move {
        router
            .entry(Box::new(sink), Box::new(stream), HashMap::new(), query_paras)
            .await
    });
    (remote, handle)
}

#[tokio::test]
async fn entry_assigns_shards_by_conn_id_modulo() {
    let router = Router::new(RouterConf::new("/shards").with_buckets(4)).unwrap();

    let mut peers = Vec::new();
    for _ in 0..12 {
        peers.push(join(&router));
    }
    wait_for(|| router.total() == 12).await;

    // ids 1..=12 land on buckets [1,2,3,0, 1,2,3,0, 1,2,3,0]
    for conn_id in 1..=12u64 {
        let expected = (conn_id % 4) as usize;
        let bucket = router.bucket(expected).unwrap();
        assert_eq!(bucket.get_conn(conn_id).unwrap().conn_id(), conn_id);
    }
    for bucket_id in 0..4 {
        assert_eq!(router.bucket(bucket_id).unwrap().total(), 3);
    }

    router.quit().await;
    for (_, handle) in peers {
        handle.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn bucket_id_query_parameter_overrides_the_hash_pick() {
    let router = Router::new(RouterConf::new("/pin").with_buckets(4)).unwrap();

    let mut query = HashMap::new();
    query.insert("bucketId".to_owned(), "2".to_owned());
    let (_peer, handle) = join_with_query(&router, query);

    wait_for(|| router.total() == 1).await;
    // conn id 1 would hash to bucket 1; the parameter pinned it to 2.
    assert_eq!(router.bucket(2).unwrap().total(), 1);
    assert_eq!(router.bucket(1).unwrap().total(), 0);

    router.quit().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn broadcast_reaches_only_the_target_subset() {
    let router = Router::new(RouterConf::new("/sub").with_buckets(1)).unwrap();

    // Join one at a time so conn ids are pinned to peers: a=1, b=2, c=3.
    let (a, _ha) = join(&router);
    wait_for(|| router.total() == 1).await;
    let (b, _hb) = join(&router);
    wait_for(|| router.total() == 2).await;
    let (c, _hc) = join(&router);
    wait_for(|| router.total() == 3).await;

    router
        .cast(MsgData::new(Bytes::from_static(b"hello")).with_conn_ids([1, 3]))
        .await
        .unwrap();

    let (_, mut a_stream) = a.split();
    let (_, mut b_stream) = b.split();
    let (_, mut c_stream) = c.split();

    for stream in [&mut a_stream, &mut c_stream] {
        let frame = tokio::time::timeout(Duration::from_secs(1), stream.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(frame.into_bytes(), Bytes::from_static(b"hello"));
    }

    // The excluded member sees nothing.
    let quiet = tokio::time::timeout(Duration::from_millis(150), b_stream.recv()).await;
    assert!(quiet.is_err(), "untargeted member must not receive the cast");

    router.quit().await;
}

#[tokio::test]
async fn targeted_broadcasts_arrive_in_enqueue_order() {
    let router = Router::new(RouterConf::new("/order").with_buckets(1)).unwrap();
    let (peer, _handle) = join(&router);
    wait_for(|| router.total() == 1).await;

    for i in 0..8u8 {
        router
            .cast(MsgData::new(Bytes::copy_from_slice(&[i])).with_conn_ids([1]))
            .await
            .unwrap();
    }

    let (_, mut stream) = peer.split();
    for i in 0..8u8 {
        let frame = tokio::time::timeout(Duration::from_secs(1), stream.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(frame.into_bytes(), Bytes::copy_from_slice(&[i]));
    }

    router.quit().await;
}

#[tokio::test]
async fn connect_and_close_callbacks_balance_under_churn() {
    let connected = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicUsize::new(0));
    let conn_count = connected.clone();
    let close_count = closed.clone();

    let router = Router::new(
        RouterConf::new("/churn")
            .with_buckets(2)
            .on_connected(move |_router, _conn_id| {
                conn_count.fetch_add(1, Ordering::SeqCst);
            })
            .on_closed(move |_router, _conn_id| {
                close_count.fetch_add(1, Ordering::SeqCst);
            }),
    )
    .unwrap();

    let mut peers = Vec::new();
    for _ in 0..6 {
        peers.push(join(&router));
    }
    wait_for(|| router.total() == 6).await;
    assert_eq!(connected.load(Ordering::SeqCst), 6);

    // Half die client-side, half are closed by the host.
    for (peer, _) in peers.drain(..3) {
        drop(peer);
    }
    wait_for(|| closed.load(Ordering::SeqCst) == 3).await;
    for conn_id in 1..=6u64 {
        if router.get_connector(conn_id).is_ok() {
            router.close_conn(conn_id).await.unwrap();
        }
    }

    wait_for(|| closed.load(Ordering::SeqCst) == 6).await;
    assert_eq!(router.total(), 0);
    assert_eq!(connected.load(Ordering::SeqCst), closed.load(Ordering::SeqCst));

    // Entry handlers have all returned: pumps are gone.
    for (_, handle) in peers {
        handle.await.unwrap().unwrap();
    }
    router.quit().await;
}

#[tokio::test]
async fn owner_lookup_walks_shards() {
    let router = Router::new(RouterConf::new("/owners").with_buckets(4)).unwrap();
    let (_a, _ha) = join(&router);
    let (_b, _hb) = join(&router);
    wait_for(|| router.total() == 2).await;

    router.set_owner(2, 900).unwrap();
    assert_eq!(router.get_conn_by_owner_id(900).unwrap().conn_id(), 2);
    assert!(router.get_conn_by_owner_id(901).is_err());
    assert!(router.set_owner(99, 1).is_err());

    router.quit().await;
}

#[tokio::test]
async fn quit_closes_every_member_and_unblocks_entry() {
    let router = Router::new(RouterConf::new("/quit").with_buckets(2)).unwrap();
    let (_a, ha) = join(&router);
    let (_b, hb) = join(&router);
    wait_for(|| router.total() == 2).await;

    router.quit().await;
    assert_eq!(router.total(), 0);

    for handle in [ha, hb] {
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("entry must return after quit")
            .unwrap()
            .unwrap();
    }
}
