use rand::prelude::SliceRandom;

use quorumchat_local_cluster::{local_address, local_cluster_tester::LocalClusterRunner};
use quorumchat_replica::{error::ChatError, msg::NodeId};

// End-to-end replication tests over the in-process network. Node `n` of a
// cluster listens at `local_address(n)`; the highest live id should lead.

#[tokio::test]
async fn initial_election() {
    let mut cr = LocalClusterRunner::new(5).unwrap();

    let leader = cr.check_one_leader().await.unwrap();
    assert_eq!(leader.id, 5);
    cr.sleep(500).await;
    assert_eq!(cr.await_leader(5).await.unwrap().id, 5);
}

#[tokio::test]
async fn re_election_after_leader_failure() {
    let mut cr = LocalClusterRunner::new(5).unwrap();
    cr.await_leader(5).await.unwrap();

    cr.kill(5).await.unwrap();
    cr.await_leader(4).await.unwrap();

    // The restarted node outranks everyone and takes over again.
    cr.restart(5).await.unwrap();
    cr.await_leader(5).await.unwrap();
    assert!(!cr.summary(4).await.unwrap().is_leader());
}

#[tokio::test]
async fn lower_nodes_yield_to_a_restarted_follower_leader() {
    let mut cr = LocalClusterRunner::new(3).unwrap();
    cr.await_leader(3).await.unwrap();

    // A restarted follower learns the leader from the leader itself.
    cr.kill(1).await.unwrap();
    cr.sleep(300).await;
    cr.restart(1).await.unwrap();
    cr.await_leader(3).await.unwrap();
}

#[tokio::test]
async fn disconnected_leader_is_replaced_and_keeps_its_role() {
    let mut cr = LocalClusterRunner::new(5).unwrap();
    cr.await_leader(5).await.unwrap();

    cr.disconnect(5).await.unwrap();
    cr.await_leader(4).await.unwrap();

    // Nothing demotes a leader that was partitioned away: there are no
    // terms, and a leader never runs the failure check.
    cr.connect(5).await.unwrap();
    cr.sleep(500).await;
    assert!(cr.summary(5).await.unwrap().is_leader());
    assert!(cr.summary(4).await.unwrap().is_leader());
}

#[tokio::test]
async fn followers_redirect_clients_to_the_leader() {
    let mut cr = LocalClusterRunner::new(3).unwrap();
    cr.await_leader(3).await.unwrap();

    let follower = cr.node(1).unwrap();
    let err = follower.create_account("alice", "pw").await.unwrap_err();
    assert_eq!(err.redirect(), Some(local_address(3).as_str()));
    assert_eq!(follower.get_leader(), local_address(3));
}

#[tokio::test]
async fn writes_need_two_peer_acks() {
    let mut cr = LocalClusterRunner::new(5).unwrap();
    cr.await_leader(5).await.unwrap();
    let leader = cr.node(5).unwrap();

    leader.create_account("alice", "pw").await.unwrap();
    leader.send_message("alice", "bob", "first").await.unwrap();
    assert!(cr.n_holding_message(1).await.unwrap() >= 3);

    // Two peers down: two acks are still available.
    cr.kill(1).await.unwrap();
    cr.kill(2).await.unwrap();
    leader.send_message("alice", "bob", "second").await.unwrap();

    // Three peers down: only one ack, and the leader must not apply.
    cr.kill(3).await.unwrap();
    let err = leader.send_message("alice", "bob", "third").await.unwrap_err();
    assert!(matches!(err, ChatError::ReplicationFailed { acks: 1, required: 2 }));
    let ids: Vec<u64> = leader
        .list_messages("bob")
        .await
        .unwrap()
        .iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(ids, vec![1, 2]);
}

#[tokio::test]
async fn repeated_follower_failures() {
    let mut cr = LocalClusterRunner::new(7).unwrap();
    cr.await_leader(7).await.unwrap();

    for round in 0..5 {
        // kill three followers
        let mut choices: Vec<NodeId> = (1..7).collect();
        choices.shuffle(&mut rand::thread_rng());
        let down = &choices[..3];
        for id in down {
            cr.kill(*id).await.unwrap();
        }

        // the leader keeps its role and the remaining three peers ack
        let leader = cr.node(7).unwrap();
        leader
            .send_message("alice", "bob", &format!("round {round}"))
            .await
            .unwrap();
        drop(leader);

        for id in down {
            cr.restart(*id).await.unwrap();
        }
        cr.await_leader(7).await.unwrap();
    }
    assert!(cr.n_holding_message(5).await.unwrap() >= 3);
}

#[tokio::test]
async fn store_survives_full_cluster_restart() {
    let mut cr = LocalClusterRunner::new(5).unwrap();
    cr.await_leader(5).await.unwrap();
    let leader = cr.node(5).unwrap();

    leader.create_account("alice", "pw-a").await.unwrap();
    leader.create_account("bob", "pw-b").await.unwrap();
    for body in ["one", "two", "three"] {
        leader.send_message("alice", "bob", body).await.unwrap();
    }
    leader.delete_messages("bob", &[2]).await.unwrap();
    drop(leader);

    for id in 1..=5 {
        cr.kill(id).await.unwrap();
    }
    cr.sleep(200).await;
    assert!(cr.has_no_leader().await.unwrap());
    // Node 5 comes back alone and leads on its own store; the rest rejoin
    // as followers.
    cr.restart(5).await.unwrap();
    for id in 1..=4 {
        cr.restart(id).await.unwrap();
    }
    cr.await_leader(5).await.unwrap();

    let leader = cr.node(5).unwrap();
    let ids: Vec<u64> = leader
        .list_messages("bob")
        .await
        .unwrap()
        .iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(ids, vec![1, 3]);
    assert_eq!(leader.login("alice", "pw-a").await.unwrap().unread_count, 0);
    assert_eq!(leader.login("bob", "pw-b").await.unwrap().unread_count, 2);

    // Ids keep counting past everything stored.
    leader.send_message("bob", "alice", "four").await.unwrap();
    assert_eq!(leader.list_messages("alice").await.unwrap()[0].id, 4);
}

#[tokio::test]
async fn new_leader_catches_up_through_sync() {
    let mut cr = LocalClusterRunner::new(5).unwrap();
    cr.await_leader(5).await.unwrap();

    // Node 4 misses every write.
    cr.kill(4).await.unwrap();
    let leader = cr.node(5).unwrap();
    leader.create_account("alice", "pw").await.unwrap();
    for body in ["a", "b", "c"] {
        leader.send_message("alice", "bob", body).await.unwrap();
    }
    drop(leader);
    cr.restart(4).await.unwrap();
    cr.await_leader(5).await.unwrap();
    assert!(cr.summary(4).await.unwrap().replica.unwrap().message_ids.is_empty());

    cr.kill(5).await.unwrap();
    cr.await_leader(4).await.unwrap();
    let leader = cr.node(4).unwrap();
    assert_eq!(leader.list_messages("bob").await.unwrap().len(), 3);
    assert_eq!(leader.list_accounts("").await.unwrap(), vec!["alice".to_string()]);

    leader.send_message("alice", "bob", "d").await.unwrap();
    let last = leader.list_messages("bob").await.unwrap().pop().unwrap();
    assert_eq!(last.id, 4);
}

#[tokio::test]
async fn subscription_ends_when_its_leader_steps_down() {
    let mut cr = LocalClusterRunner::new(5).unwrap();
    cr.await_leader(5).await.unwrap();
    cr.kill(5).await.unwrap();
    cr.await_leader(4).await.unwrap();

    let leader = cr.node(4).unwrap();
    let mut bob = leader.subscribe("bob").unwrap();
    leader.send_message("alice", "bob", "live").await.unwrap();
    assert_eq!(bob.next().await.unwrap().body, "live");

    cr.restart(5).await.unwrap();
    cr.await_leader(5).await.unwrap();
    assert_eq!(bob.next().await, None);
    assert!(leader.subscriptions().is_empty());
}
