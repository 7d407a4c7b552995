//! End-to-end tests against a scripted in-process server.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{connect_tree, echo_reply, establish, reply_header, unsolicited, Harness, SESSION_ID, WAIT};
use smbengine_client::{BreakKey, BreakNotification, ClientError, ConnectionState, HookEvent, LeaseRequest, OpenOptions};
use smbengine_codec::oplock::LEASE_BREAK_ACK_REQUIRED;
use smbengine_codec::session_setup::session_flags;
use smbengine_codec::{
    Addressing, Body, Command, CreateContext, CreateResponse, ErrorResponse, FileAttributes, FileId, LeaseBreakAck,
    LeaseBreakNotification, LeaseContext, LeaseKey, LeaseState, LeaseV2, OplockBreak, OplockLevel, PlainMessage,
    Status,
};

#[tokio::test]
async fn test_signed_session_round_trip() {
    let Harness {
        session, mut peer, ..
    } = establish(0).await;
    assert!(session.is_signed());
    assert!(!session.is_encrypted());

    let (response, ()) = tokio::join!(session.send(session.request(Body::EchoRequest).unwrap()), async {
        let request = peer.recv().await;
        let echo = &request.messages[0];
        assert!(echo.header.flags.is_signed());
        assert!(peer.signer.as_ref().unwrap().verify(&request.raw).unwrap());
        peer.reply(vec![echo_reply(echo)]).await;
    });
    let response = response.unwrap();
    assert!(response.header().flags.is_signed());
    assert!(!response.encrypted);
}

#[tokio::test]
async fn test_bad_signature_fails_only_that_request() {
    let Harness {
        connection,
        session,
        mut peer,
        ..
    } = establish(0).await;
    let first = session.submit(vec![session.request(Body::EchoRequest).unwrap()]).unwrap().remove(0);
    let second = session.submit(vec![session.request(Body::EchoRequest).unwrap()]).unwrap().remove(0);

    let a = peer.recv().await;
    let b = peer.recv().await;
    peer.reply(vec![echo_reply(&a.messages[0])]).await;
    let mut forged = peer.encode(vec![echo_reply(&b.messages[0])], true);
    forged[smbengine_codec::SIGNATURE_OFFSET] ^= 0xFF;
    peer.send_plain(&forged).await;

    first.wait_timeout(WAIT).await.unwrap();
    let err = second.wait_timeout(WAIT).await.unwrap_err();
    assert!(matches!(err.root(), ClientError::SignatureMismatch { message_id } if *message_id == second.message_id()));
    assert!(!connection.is_closed());

    let (response, ()) = tokio::join!(session.send(session.request(Body::EchoRequest).unwrap()), async {
        let request = peer.recv().await;
        peer.reply(vec![echo_reply(&request.messages[0])]).await;
    });
    assert!(response.is_ok());
}

#[tokio::test]
async fn test_unsigned_response_on_signing_session_is_rejected() {
    let Harness {
        connection,
        session,
        mut peer,
        ..
    } = establish(0).await;
    let stripped = session.submit(vec![session.request(Body::EchoRequest).unwrap()]).unwrap().remove(0);
    let request = peer.recv().await;
    let payload = peer.encode(vec![echo_reply(&request.messages[0])], false);
    peer.send_plain(&payload).await;

    let err = stripped.wait_timeout(WAIT).await.unwrap_err();
    assert!(matches!(err.root(), ClientError::SignatureMismatch { message_id } if *message_id == stripped.message_id()));
    assert!(!connection.is_closed());

    // Interim responses are never signed and must not trip the check.
    let pending = session.submit(vec![session.request(Body::EchoRequest).unwrap()]).unwrap().remove(0);
    let request = peer.recv().await;
    let mut interim = reply_header(&request.messages[0].header, Status::PENDING);
    interim.addressing = Addressing::Async { async_id: 0x42 };
    let payload = peer.encode(
        vec![PlainMessage::new(interim, Body::ErrorResponse(ErrorResponse::default()))],
        false,
    );
    peer.send_plain(&payload).await;
    tokio::time::timeout(WAIT, async {
        while pending.async_id().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    peer.reply(vec![echo_reply(&request.messages[0])]).await;
    assert!(pending.wait_timeout(WAIT).await.is_ok());
}

#[tokio::test]
async fn test_encrypted_session_seals_both_directions() {
    let Harness {
        session, mut peer, ..
    } = establish(session_flags::ENCRYPT_DATA).await;
    assert!(session.is_encrypted());

    let (response, ()) = tokio::join!(session.send(session.request(Body::EchoRequest).unwrap()), async {
        let request = peer.recv().await;
        assert!(request.sealed);
        let echo = &request.messages[0];
        assert!(!echo.header.flags.is_signed());
        let payload = peer.encode(vec![echo_reply(echo)], false);
        peer.send_sealed(SESSION_ID, &payload).await;
    });
    let response = response.unwrap();
    assert!(response.encrypted);
    assert!(matches!(response.body(), Body::EchoResponse));
}

#[tokio::test]
async fn test_compound_goes_out_as_one_frame() {
    let Harness {
        connection,
        session,
        mut peer,
        ..
    } = establish(0).await;
    let sends = Arc::new(AtomicUsize::new(0));
    let counter = sends.clone();
    connection.register_callback(HookEvent::PreSend, move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let batch = vec![
        session.request(Body::EchoRequest).unwrap(),
        session.request(Body::EchoRequest).unwrap().related(),
    ];
    let (responses, ()) = tokio::join!(session.transceive(batch), async {
        let request = peer.recv().await;
        assert_eq!(request.messages.len(), 2);
        assert!(!request.messages[0].header.flags.is_related());
        assert!(request.messages[1].header.flags.is_related());
        assert_eq!(request.messages[1].header.message_id, request.messages[0].header.message_id + 1);
        let replies = request.messages.iter().map(echo_reply).collect();
        peer.reply(replies).await;
    });
    assert_eq!(responses.unwrap().len(), 2);
    assert_eq!(sends.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_close_shares_one_error_across_waiters() {
    let Harness {
        connection,
        session,
        mut peer,
        ..
    } = establish(0).await;
    let futures = session
        .submit(vec![session.request(Body::EchoRequest).unwrap()])
        .unwrap()
        .into_iter()
        .chain(session.submit(vec![session.request(Body::EchoRequest).unwrap()]).unwrap())
        .collect::<Vec<_>>();
    peer.recv().await;
    peer.recv().await;
    assert_eq!(connection.in_flight(), 2);

    connection.close();
    let first = futures[0].outcome().unwrap().unwrap_err();
    let second = futures[1].outcome().unwrap().unwrap_err();
    assert!(Arc::ptr_eq(&first, &second));
    assert!(matches!(*first, ClientError::ConnectionClosed));

    let err = futures[0].wait().await.unwrap_err();
    assert!(matches!(err, ClientError::Shared(_)));
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert_eq!(connection.in_flight(), 0);
}

#[tokio::test]
async fn test_cancel_after_interim_uses_async_id() {
    let Harness {
        connection,
        session,
        mut peer,
        ..
    } = establish(0).await;
    let target = session.submit(vec![session.request(Body::EchoRequest).unwrap()]).unwrap().remove(0);
    let request = peer.recv().await;
    let original = request.messages[0].header.clone();

    let mut interim = reply_header(&original, Status::PENDING);
    interim.addressing = Addressing::Async { async_id: 0x99 };
    let payload = peer.encode(
        vec![PlainMessage::new(interim, Body::ErrorResponse(ErrorResponse::default()))],
        false,
    );
    peer.send_plain(&payload).await;

    tokio::time::timeout(WAIT, async {
        while target.async_id().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(!target.is_done());

    let returned = connection.cancel(&target).unwrap();
    assert!(returned.same_request(&target));
    let cancel = peer.recv().await;
    let header = &cancel.messages[0].header;
    assert_eq!(header.command, Command::Cancel);
    assert_eq!(header.message_id, original.message_id);
    assert_eq!(header.addressing, Addressing::Async { async_id: 0x99 });
    assert_eq!(header.credit_charge, 0);

    let mut last = reply_header(&original, Status::CANCELLED);
    last.addressing = Addressing::Async { async_id: 0x99 };
    peer.reply(vec![PlainMessage::new(last, Body::ErrorResponse(ErrorResponse::default()))])
        .await;
    let err = target.wait_timeout(WAIT).await.unwrap_err();
    assert_eq!(err.status(), Some(Status::CANCELLED));
    assert!(matches!(connection.cancel(&target), Err(ClientError::State { .. })));
}

#[tokio::test]
async fn test_unsolicited_oplock_breaks_reach_the_client_scope() {
    let Harness { client, mut peer, .. } = establish(0).await;
    let armed = FileId::new(1, 1);
    let unarmed = FileId::new(2, 2);
    let waiter = client.scope().breaks.register(BreakKey::Oplock(armed)).unwrap();

    for file_id in [armed, unarmed] {
        let message = unsolicited(Body::OplockBreak(OplockBreak {
            oplock_level: OplockLevel::LevelII,
            file_id,
        }));
        let payload = peer.encode(vec![message], false);
        peer.send_plain(&payload).await;
    }

    match waiter.wait_timeout(WAIT).await.unwrap() {
        BreakNotification::Oplock(notification) => {
            assert_eq!(notification.file_id, armed);
            assert_eq!(notification.oplock_level, OplockLevel::LevelII);
        }
        other => panic!("unexpected {other:?}"),
    }
    tokio::time::timeout(WAIT, async {
        while client.scope().breaks.queued(&BreakKey::Oplock(unarmed)) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_lease_break_is_acknowledged_and_applied() {
    let Harness {
        client,
        session,
        mut peer,
        ..
    } = establish(0).await;

    let tree = connect_tree(&session, &mut peer, 5).await;

    let key = LeaseKey::from_u128(0xABCD);
    let options = OpenOptions {
        lease: Some(LeaseRequest {
            key,
            state: LeaseState::RWH,
            parent: None,
        }),
        ..Default::default()
    };
    let file_id = FileId::new(10, 20);
    let (handle, ()) = tokio::join!(tree.open("a.txt", &options), async {
        let request = peer.recv().await;
        let create = &request.messages[0];
        assert_eq!(create.header.tree_id(), Some(5));
        let Body::CreateRequest(body) = &create.body else {
            panic!("expected create");
        };
        assert_eq!(body.requested_oplock_level, OplockLevel::Lease);
        assert_eq!(body.lease().unwrap().key, key);
        peer.reply(vec![PlainMessage::new(
            reply_header(&create.header, Status::SUCCESS),
            Body::CreateResponse(CreateResponse {
                oplock_level: OplockLevel::Lease,
                flags: 0,
                create_action: 2,
                attributes: FileAttributes::default(),
                file_id,
                contexts: vec![CreateContext::Lease(LeaseContext {
                    key,
                    state: LeaseState::RWH,
                    flags: 0,
                    v2: Some(LeaseV2 {
                        parent_key: LeaseKey::default(),
                        epoch: 1,
                    }),
                })],
            }),
        )])
        .await;
    });
    let handle = handle.unwrap();
    assert_eq!(handle.file_id(), file_id);
    let lease = handle.lease().unwrap();
    assert_eq!(lease.state(), LeaseState::RWH);
    assert_eq!(lease.epoch(), 1);
    assert_eq!(client.scope().leases.refcount(&key), 1);

    let notification = unsolicited(Body::LeaseBreakNotification(LeaseBreakNotification {
        new_epoch: 2,
        flags: LEASE_BREAK_ACK_REQUIRED,
        lease_key: key,
        current_state: LeaseState::RWH,
        new_state: LeaseState(LeaseState::READ),
    }));
    let payload = peer.encode(vec![notification], false);
    peer.send_plain(&payload).await;

    let received = tokio::time::timeout(WAIT, lease.next_break()).await.unwrap().unwrap();
    assert!(received.ack_required());

    let (kept, ()) = tokio::join!(handle.acknowledge_lease_break(&received, |offered| offered), async {
        let request = peer.recv().await;
        let ack = &request.messages[0];
        let Body::LeaseBreakAck(body) = &ack.body else {
            panic!("expected lease break ack");
        };
        assert_eq!(body.lease_key, key);
        assert_eq!(body.lease_state, LeaseState(LeaseState::READ));
        peer.reply(vec![PlainMessage::new(
            reply_header(&ack.header, Status::SUCCESS),
            Body::LeaseBreakAck(LeaseBreakAck {
                lease_key: key,
                lease_state: LeaseState(LeaseState::READ),
            }),
        )])
        .await;
    });
    assert_eq!(kept.unwrap(), LeaseState(LeaseState::READ));
    assert_eq!(lease.state(), LeaseState(LeaseState::READ));
    assert_eq!(lease.epoch(), 2);
}
