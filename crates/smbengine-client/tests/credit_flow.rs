//! Credit accounting and message-id allocation over a scripted server.

mod common;

use std::time::Duration;

use common::{attach, init_tracing, negotiate_response, negotiate_with, reply_header, Peer, QUIET, WAIT};
use smbengine_client::{Client, ClientConfig, Connection, Request, RequestFuture};
use smbengine_codec::negotiate::security_mode;
use smbengine_codec::{
    Addressing, Body, Command, Dialect, ErrorResponse, FileId, PlainMessage, ReadRequest, ReadResponse, Status,
};

/// An unsigned 2.1 connection negotiated with a grant of `grant`.
async fn negotiated(grant: u16) -> (Client, Connection, Peer) {
    init_tracing();
    let client = Client::new(ClientConfig {
        dialects: vec![Dialect::Smb210 as u16],
        ..Default::default()
    });
    let (connection, mut peer) = attach(&client);
    let mut response = negotiate_response(Dialect::Smb210, Vec::new());
    response.security_mode = security_mode::SIGNING_ENABLED;
    let (info, _) = negotiate_with(&connection, &mut peer, response, grant).await;
    assert_eq!(info.unwrap().dialect, Dialect::Smb210);
    assert_eq!(connection.credits(), u32::from(grant));
    (client, connection, peer)
}

fn echo(connection: &Connection) -> RequestFuture {
    connection.submit_one(Request::new(Body::EchoRequest).unwrap()).unwrap()
}

async fn wait_for_interim(future: &RequestFuture) {
    tokio::time::timeout(WAIT, async {
        while future.async_id().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_window_of_one_holds_until_granted() {
    let (_client, connection, mut peer) = negotiated(1).await;
    let futures: Vec<_> = (0..3).map(|_| echo(&connection)).collect();

    let first = peer.recv().await;
    assert_eq!(first.first().header.message_id, futures[0].message_id());
    assert!(peer.recv_within(QUIET).await.is_none());
    assert_eq!(connection.credits(), 0);
    assert_eq!(connection.in_flight(), 3);

    peer.answer(first.first(), Body::EchoResponse, 2).await;
    let second = peer.recv().await;
    let third = peer.recv().await;
    assert_eq!(second.first().header.message_id, futures[0].message_id() + 1);
    assert_eq!(third.first().header.message_id, futures[0].message_id() + 2);
    peer.answer(second.first(), Body::EchoResponse, 1).await;
    peer.answer(third.first(), Body::EchoResponse, 1).await;

    for future in &futures {
        future.wait_timeout(WAIT).await.unwrap();
    }
    // 1 granted at negotiate, then 2 + 1 + 1, less 3 spent on the echoes.
    assert_eq!(connection.credits(), 2);
    assert_eq!(connection.in_flight(), 0);
}

#[tokio::test]
async fn test_multi_credit_read_debits_at_send_and_reserves_a_range() {
    let (_client, connection, mut peer) = negotiated(2).await;
    let opener = echo(&connection);
    let opener_request = peer.recv().await;
    assert_eq!(connection.credits(), 1);

    let read = connection
        .submit_one(
            Request::new(Body::ReadRequest(ReadRequest {
                length: 4 * 65536,
                offset: 0,
                file_id: FileId::new(1, 1),
                minimum_count: 0,
            }))
            .unwrap(),
        )
        .unwrap();
    let trailing = echo(&connection);
    assert_eq!(read.message_id(), opener.message_id() + 1);
    assert_eq!(trailing.message_id(), read.message_id() + 4);

    // Both stay queued and nothing is debited until the read fits the window.
    assert!(peer.recv_within(QUIET).await.is_none());
    assert_eq!(connection.credits(), 1);
    assert_eq!(connection.in_flight(), 3);

    peer.answer(opener_request.first(), Body::EchoResponse, 3).await;
    let read_request = peer.recv().await;
    let header = &read_request.first().header;
    assert_eq!(header.command, Command::Read);
    assert_eq!(header.message_id, read.message_id());
    assert_eq!(header.credit_charge, 4);
    assert!(header.credits >= 4);
    assert_eq!(connection.credits(), 0);
    assert!(peer.recv_within(QUIET).await.is_none());

    peer.answer(
        read_request.first(),
        Body::ReadResponse(ReadResponse {
            data: vec![0xAB; 16],
            data_remaining: 0,
        }),
        5,
    )
    .await;
    let echo_request = peer.recv().await;
    assert_eq!(echo_request.first().header.message_id, trailing.message_id());
    peer.answer(echo_request.first(), Body::EchoResponse, 1).await;

    let response = read.wait_timeout(WAIT).await.unwrap();
    assert!(matches!(response.body(), Body::ReadResponse(r) if r.data.len() == 16));
    trailing.wait_timeout(WAIT).await.unwrap();
    assert_eq!(connection.credits(), 5);
}

#[tokio::test]
async fn test_cancel_skips_a_batch_held_for_credits() {
    let (_client, connection, mut peer) = negotiated(1).await;
    let target = echo(&connection);
    let request = peer.recv().await;
    let original = request.first().header.clone();

    let mut interim = reply_header(&original, Status::PENDING);
    interim.addressing = Addressing::Async { async_id: 0x77 };
    interim.credits = 0;
    let payload = peer.encode(
        vec![PlainMessage::new(interim, Body::ErrorResponse(ErrorResponse::default()))],
        false,
    );
    peer.send_plain(&payload).await;
    wait_for_interim(&target).await;

    let held = echo(&connection);
    assert!(peer.recv_within(QUIET).await.is_none());
    assert_eq!(connection.credits(), 0);

    connection.cancel(&target).unwrap();
    let cancel = peer.recv().await;
    let header = &cancel.first().header;
    assert_eq!(header.command, Command::Cancel);
    assert_eq!(header.message_id, target.message_id());
    assert_eq!(header.addressing, Addressing::Async { async_id: 0x77 });

    let mut last = reply_header(&original, Status::CANCELLED);
    last.addressing = Addressing::Async { async_id: 0x77 };
    last.credits = 1;
    peer.reply(vec![PlainMessage::new(last, Body::ErrorResponse(ErrorResponse::default()))])
        .await;
    let err = target.wait_timeout(WAIT).await.unwrap_err();
    assert_eq!(err.status(), Some(Status::CANCELLED));

    let released = peer.recv().await;
    assert_eq!(released.first().header.message_id, held.message_id());
    peer.answer(released.first(), Body::EchoResponse, 1).await;
    held.wait_timeout(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_blacklisted_ids_never_reach_the_wire() {
    let (_client, connection, mut peer) = negotiated(8).await;
    connection.blacklist_message_id(1);
    connection.blacklist_message_id(2);

    let first = echo(&connection);
    let second = echo(&connection);
    assert_eq!(first.message_id(), 3);
    assert_eq!(second.message_id(), 4);
    for expected in [3, 4] {
        let request = peer.recv().await;
        assert_eq!(request.first().header.message_id, expected);
        peer.answer(request.first(), Body::EchoResponse, 1).await;
    }
    first.wait_timeout(WAIT).await.unwrap();
    second.wait_timeout(WAIT).await.unwrap();
}
