//! Dynamic registry and group behavior over the in-process transport:
//! room lifecycle, admission control, owner-targeted casts.

use bytes::Bytes;
use riptide_core::inproc::{self, InprocPipe};
use riptide_core::prelude::*;
use std::collections::HashMap;
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

fn enter(dynamic: &Arc<Dynamic>, group_id: i64) -> (InprocPipe, JoinHandle<Result<()>>) {
    let (local, remote) = inproc::pair();
    let (sink, stream) = local.split();
    let mut uri_paras = HashMap::new();
    uri_paras.insert("groupId".to_owned(), group_id.to_string());
    let dynamic = dynamic.clone();
    let handle = tokio::spawn(async move {
        dynamic
            .entry(Box::new(sink), Box::new(stream), uri_paras, HashMap::new())
            .await
    });
    (remote, handle)
}

#[tokio::test]
async fn on_demand_room_lifecycle() {
    let dynamic = Dynamic::new(GroupConf::new("/room")).unwrap();

    // First connection materializes the group.
    let (peer, handle) = enter(&dynamic, 42);
    wait_for(|| dynamic.get_group(42).is_ok()).await;
    let group = dynamic.get_group(42).unwrap();
    wait_for(|| group.total() == 1).await;

    // Disconnect: the group stays registered, just empty.
    drop(peer);
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("entry must return on disconnect")
        .unwrap()
        .unwrap();
    wait_for(|| group.total() == 0).await;
    assert!(dynamic.get_group(42).is_ok());

    // Removal is explicit.
    dynamic.remove_group(42).await.unwrap();
    assert!(matches!(
        dynamic.get_group(42),
        Err(RiptideError::NotFound(_))
    ));
}

#[tokio::test]
async fn remove_group_force_closes_members() {
    let dynamic = Dynamic::new(GroupConf::new("/room")).unwrap();

    let (_peer_a, ha) = enter(&dynamic, 7);
    let (_peer_b, hb) = enter(&dynamic, 7);
    wait_for(|| dynamic.get_group(7).map(|g| g.total()).unwrap_or(0) == 2).await;

    dynamic.remove_group(7).await.unwrap();

    for handle in [ha, hb] {
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("entry must return when its group is removed")
            .unwrap()
            .unwrap();
    }
    assert!(dynamic.get_group(7).is_err());
}

#[tokio::test]
async fn preregistered_mode_rejects_unknown_rooms() {
    let dynamic = Dynamic::new(
        GroupConf::new("/arena").with_create_mode(GroupCreateMode::Preregistered),
    )
    .unwrap();

    let (_peer, handle) = enter(&dynamic, 5);
    let outcome = tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("entry must fail fast")
        .unwrap();
    assert!(matches!(outcome, Err(RiptideError::NotFound(_))));

    // After explicit creation the same room admits connections.
    dynamic.create_group(5).unwrap();
    let (_peer, _handle) = enter(&dynamic, 5);
    wait_for(|| dynamic.get_group(5).unwrap().total() == 1).await;
    dynamic.quit().await;
}

#[tokio::test]
async fn verify_callback_gates_admission() {
    let dynamic = Dynamic::new(GroupConf::new("/guarded").verify_group(|_dynamic, group_id| {
        if group_id == 13 {
            Err(RiptideError::InvalidParameter("unlucky room"))
        } else {
            Ok(())
        }
    }))
    .unwrap();

    let (_peer, handle) = enter(&dynamic, 13);
    let outcome = tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(outcome.is_err());
    assert!(dynamic.get_group(13).is_err(), "rejected entry must not create the room");

    let (_peer, _handle) = enter(&dynamic, 14);
    wait_for(|| dynamic.get_group(14).is_ok()).await;
    dynamic.quit().await;
}

#[tokio::test]
async fn cast_merges_owner_and_conn_targets() {
    let dynamic = Dynamic::new(GroupConf::new("/room")).unwrap();

    // Sequential joins pin conn ids: a=1, b=2, c=3.
    let (a, _ha) = enter(&dynamic, 1);
    wait_for(|| dynamic.get_group(1).map(|g| g.total()).unwrap_or(0) == 1).await;
    let group = dynamic.get_group(1).unwrap();
    let (b, _hb) = enter(&dynamic, 1);
    wait_for(|| group.total() == 2).await;
    let (c, _hc) = enter(&dynamic, 1);
    wait_for(|| group.total() == 3).await;

    group.set_owner(2, 70).unwrap();

    // Target conn 1 explicitly and conn 2 through its owner id.
    dynamic
        .cast(
            1,
            MsgData::new(Bytes::from_static(b"mixed"))
                .with_conn_ids([1])
                .with_owner_ids([70]),
        )
        .await
        .unwrap();

    let (_, mut a_stream) = a.split();
    let (_, mut b_stream) = b.split();
    let (_, mut c_stream) = c.split();

    for stream in [&mut a_stream, &mut b_stream] {
        let frame = tokio::time::timeout(Duration::from_secs(1), stream.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(frame.into_bytes(), Bytes::from_static(b"mixed"));
    }
    let quiet = tokio::time::timeout(Duration::from_millis(150), c_stream.recv()).await;
    assert!(quiet.is_err(), "untargeted member must not receive the cast");

    dynamic.quit().await;
}

#[tokio::test]
async fn group_read_callback_sees_inbound_frames() {
    use riptide_core::wire::WireSink;

    let (probe_tx, probe_rx) = flume::unbounded::<(i64, u64, Bytes)>();
    let dynamic = Dynamic::new(GroupConf::new("/echo").on_read(
        move |_group, group_id, conn_id, _message_type, payload| {
            if let Payload::Octet(bytes) = payload {
                let _ = probe_tx.send((group_id, conn_id, bytes));
            }
        },
    ))
    .unwrap();

    let (peer, _handle) = enter(&dynamic, 9);
    wait_for(|| dynamic.get_group(9).map(|g| g.total()).unwrap_or(0) == 1).await;

    let (mut sink, _stream) = peer.split();
    sink.send(WireFrame::Binary(Bytes::from_static(b"inbound")))
        .await
        .unwrap();

    let (group_id, conn_id, bytes) = tokio::time::timeout(Duration::from_secs(1), probe_rx.recv_async())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(group_id, 9);
    assert_eq!(conn_id, 1);
    assert_eq!(bytes, Bytes::from_static(b"inbound"));

    dynamic.quit().await;
}
