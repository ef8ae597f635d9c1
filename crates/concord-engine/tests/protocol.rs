mod common;

use concord_engine::{Error, ProposalPhase, Quorum};
use concord_types::{ChangeKind, Party, ThreadId};

use common::{Mesh, eventually, parties, party, roster};

async fn thread(mesh: &Mesh, admin: &str, receivers: &[&str]) -> ThreadId {
    let meta = mesh
        .node(admin)
        .create_thread(&parties(receivers), "kickoff", "first message")
        .await
        .unwrap();
    for name in receivers {
        let node = mesh.node(name);
        eventually("thread to reach every receiver", || node.thread(meta.thread_id).is_ok()).await;
    }
    meta.thread_id
}

fn phase_is(mesh: &Mesh, name: &str, thread_id: ThreadId, want: ProposalPhase) -> bool {
    mesh.node(name).phase(thread_id).ok() == Some(want)
}

#[tokio::test]
async fn added_party_joins_with_full_history() {
    let mesh = Mesh::manual(&["x", "y", "z"]).await;
    let thread_id = thread(&mesh, "x", &["y"]).await;
    mesh.node("y").send_message(thread_id, "re", "second", None).await.unwrap();

    let proposal = mesh
        .node("y")
        .propose(thread_id, ChangeKind::AddParticipants, &[party("z")], &[])
        .await
        .unwrap();
    assert_eq!(proposal.required_signers, roster(&["x", "y"]));

    eventually("x to see the proposal", || phase_is(&mesh, "x", thread_id, ProposalPhase::Proposed)).await;
    mesh.node("x").agree(thread_id).await.unwrap();

    let y = mesh.node("y");
    eventually("y to see x agree", || y.evaluate(thread_id).ok() == Some(Quorum::Complete)).await;

    let meta = y.finalize_participant_update(thread_id).await.unwrap();
    assert_eq!(meta.receivers, roster(&["y", "z"]));
    assert_eq!(meta.admin, party("x"));

    let z = mesh.node("z");
    eventually("z to receive the new meta", || {
        z.thread(thread_id).map(|m| m.receivers == roster(&["y", "z"])).unwrap_or(false)
    })
    .await;
    let history: Vec<String> = z.messages(thread_id).unwrap().into_iter().map(|m| m.content).collect();
    assert_eq!(history, vec!["first message", "second"]);
    assert!(z.messages(thread_id).unwrap().iter().all(|m| m.visible_to == party("z")));

    let x = mesh.node("x");
    eventually("x to record the new roster", || {
        x.thread(thread_id).map(|m| m.receivers.contains(&party("z"))).unwrap_or(false)
    })
    .await;
    assert_eq!(x.phase(thread_id).unwrap(), ProposalPhase::Idle);
    assert_eq!(mesh.live_proposals(thread_id), 0);
}

#[tokio::test]
async fn rejection_leaves_the_thread_untouched() {
    let mesh = Mesh::new(&["x", "y", "z"]).await;
    let thread_id = thread(&mesh, "x", &["y", "z"]).await;

    mesh.node("x").propose(thread_id, ChangeKind::Close, &[], &[]).await.unwrap();
    for name in ["y", "z"] {
        eventually("proposal to spread", || phase_is(&mesh, name, thread_id, ProposalPhase::Proposed)).await;
    }
    mesh.node("y").agree(thread_id).await.unwrap();
    eventually("z to see y agree", || {
        phase_is(&mesh, "z", thread_id, ProposalPhase::Agreed { agreed: 1, needed: 2 })
    })
    .await;
    mesh.node("z").reject(thread_id).await.unwrap();

    for name in ["x", "y", "z"] {
        let node = mesh.node(name);
        eventually("rejection to spread", || node.evaluate(thread_id).ok() == Some(Quorum::Rejected)).await;
        assert!(node.thread(thread_id).unwrap().is_active());
        assert_eq!(node.messages(thread_id).unwrap().len(), 1);
    }

    let err = mesh.node("x").finalize_close(thread_id).await.unwrap_err();
    assert!(matches!(err, Error::NotQuorate(_)));
}

#[tokio::test]
async fn second_proposal_waits_for_the_first() {
    let mesh = Mesh::new(&["x", "y", "z"]).await;
    let thread_id = thread(&mesh, "x", &["y", "z"]).await;

    mesh.node("x")
        .propose(thread_id, ChangeKind::AddParticipants, &[party("w")], &[])
        .await
        .unwrap();
    eventually("y to see the proposal", || phase_is(&mesh, "y", thread_id, ProposalPhase::Proposed)).await;

    let err = mesh
        .node("y")
        .propose(thread_id, ChangeKind::RemoveParticipants, &[], &[party("z")])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ProposalAlreadyOutstanding(_)));
}

#[tokio::test]
async fn concurrent_proposals_commit_exactly_once() {
    let mesh = Mesh::new(&["x", "y", "z"]).await;
    let thread_id = thread(&mesh, "x", &["y", "z"]).await;
    let (w, v) = (parties(&["w"]), parties(&["v"]));

    // Both additions keep every member a signer, so the winner reaches all
    let (a, b) = tokio::join!(
        mesh.node("x").propose(thread_id, ChangeKind::AddParticipants, &w, &[]),
        mesh.node("y").propose(thread_id, ChangeKind::AddParticipants, &v, &[]),
    );

    let (won, lost) = match (a, b) {
        (Ok(won), Err(lost)) | (Err(lost), Ok(won)) => (won, lost),
        (a, b) => panic!("expected exactly one winner, got {:?} and {:?}", a, b),
    };
    assert!(matches!(lost, Error::CommitConflict { .. }), "unexpected error: {}", lost);
    assert_eq!(mesh.live_proposals(thread_id), 1);

    let mut holders = won.required_signers.clone();
    holders.insert(won.proposer.clone());
    for holder in &holders {
        let node = mesh.node(holder.as_str());
        eventually("winner to spread", || {
            node.proposals(thread_id)
                .map(|records| records.iter().any(|r| r.id == won.id))
                .unwrap_or(false)
        })
        .await;
        let live = node.proposals(thread_id).unwrap();
        assert_eq!(live.iter().filter(|r| r.is_proposed()).count(), 1);
    }
}

#[tokio::test]
async fn concurrent_add_and_remove_commit_exactly_once() {
    let mesh = Mesh::new(&["x", "y", "z"]).await;
    let thread_id = thread(&mesh, "x", &["y", "z"]).await;
    let (w, z) = (parties(&["w"]), parties(&["z"]));

    let (a, b) = tokio::join!(
        mesh.node("x").propose(thread_id, ChangeKind::AddParticipants, &w, &[]),
        mesh.node("y").propose(thread_id, ChangeKind::RemoveParticipants, &[], &z),
    );

    let (won, lost) = match (a, b) {
        (Ok(won), Err(lost)) | (Err(lost), Ok(won)) => (won, lost),
        (a, b) => panic!("expected exactly one winner, got {:?} and {:?}", a, b),
    };
    assert!(matches!(lost, Error::CommitConflict { .. }), "unexpected error: {}", lost);
    assert_eq!(mesh.live_proposals(thread_id), 1);

    // Only the winner's signers hold it; a removed party never sees it
    for signer in &won.required_signers {
        let node = mesh.node(signer.as_str());
        eventually("winner to reach its signers", || {
            node.proposals(thread_id)
                .map(|records| records.iter().any(|r| r.id == won.id))
                .unwrap_or(false)
        })
        .await;
    }
}

#[tokio::test]
async fn malformed_changes_fail_before_commit() {
    let mesh = Mesh::new(&["x", "y", "z"]).await;
    let thread_id = thread(&mesh, "x", &["y", "z"]).await;
    let x = mesh.node("x");

    for (to_add, to_remove) in [
        (parties(&["w", "w"]), vec![]),
        (parties(&["w"]), parties(&["w"])),
        (vec![], parties(&["z", "z"])),
    ] {
        let err = x
            .propose(thread_id, ChangeKind::AddParticipants, &to_add, &to_remove)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidActionArguments(_)), "unexpected error: {}", err);
    }
    assert_eq!(mesh.live_proposals(thread_id), 0);
    assert_eq!(x.phase(thread_id).unwrap(), ProposalPhase::Idle);
}

#[tokio::test]
async fn removed_parties_never_sign_their_removal() {
    let mesh = Mesh::manual(&["x", "y", "z"]).await;
    let thread_id = thread(&mesh, "x", &["y", "z"]).await;

    let proposal = mesh
        .node("y")
        .propose(thread_id, ChangeKind::RemoveParticipants, &[], &[party("z")])
        .await
        .unwrap();
    assert_eq!(proposal.required_signers, roster(&["x", "y"]));
    assert!(!proposal.required_signers.contains(&party("z")));

    // z holds no copy of a proposal it cannot sign
    eventually("x to see the proposal", || phase_is(&mesh, "x", thread_id, ProposalPhase::Proposed)).await;
    assert_eq!(mesh.node("z").phase(thread_id).unwrap(), ProposalPhase::Idle);
    let err = mesh.node("z").agree(thread_id).await.unwrap_err();
    assert!(matches!(err, Error::NoOutstandingProposal(_)));
}

#[tokio::test]
async fn self_removal_is_refused() {
    let mesh = Mesh::new(&["x", "y", "z"]).await;
    let thread_id = thread(&mesh, "x", &["y", "z"]).await;

    let err = mesh
        .node("y")
        .propose(thread_id, ChangeKind::RemoveParticipants, &[], &[party("y")])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidActionArguments(_)));
}

#[tokio::test]
async fn agreeing_twice_is_a_no_op() {
    let mesh = Mesh::new(&["x", "y", "z"]).await;
    let thread_id = thread(&mesh, "x", &["y", "z"]).await;

    mesh.node("x").propose(thread_id, ChangeKind::Close, &[], &[]).await.unwrap();
    eventually("y to see the proposal", || phase_is(&mesh, "y", thread_id, ProposalPhase::Proposed)).await;

    let y = mesh.node("y");
    let first = y.agree(thread_id).await.unwrap();
    let second = y.agree(thread_id).await.unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(mesh.notary.live_claims(&format!("agreed:{}", first.proposal_id)), 1);

    let err = y.reject(thread_id).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyAgreed { .. }));
}

#[tokio::test]
async fn only_the_proposer_finalizes_and_only_when_quorate() {
    let mesh = Mesh::manual(&["x", "y", "z"]).await;
    let thread_id = thread(&mesh, "x", &["y", "z"]).await;

    mesh.node("x").propose(thread_id, ChangeKind::Close, &[], &[]).await.unwrap();
    for name in ["y", "z"] {
        eventually("proposal to spread", || phase_is(&mesh, name, thread_id, ProposalPhase::Proposed)).await;
    }

    let err = mesh.node("x").finalize_close(thread_id).await.unwrap_err();
    assert!(matches!(err, Error::NotQuorate(_)));

    mesh.node("y").agree(thread_id).await.unwrap();
    mesh.node("z").agree(thread_id).await.unwrap();

    let err = mesh.node("y").finalize_close(thread_id).await.unwrap_err();
    assert!(matches!(err, Error::NotProposer { .. }));

    let x = mesh.node("x");
    eventually("x to reach quorum", || x.evaluate(thread_id).ok() == Some(Quorum::Complete)).await;
    x.finalize_close(thread_id).await.unwrap();

    let z = mesh.node("z");
    eventually("z to apply the close", || z.threads().map(|t| t.is_empty()).unwrap_or(false)).await;
    let err = z.reject(thread_id).await.unwrap_err();
    assert!(matches!(err, Error::NothingToReject(_)));
}

#[tokio::test]
async fn rejected_proposal_can_be_replaced() {
    let mesh = Mesh::new(&["x", "y"]).await;
    let thread_id = thread(&mesh, "x", &["y"]).await;

    mesh.node("x").propose(thread_id, ChangeKind::Close, &[], &[]).await.unwrap();
    eventually("y to see the proposal", || phase_is(&mesh, "y", thread_id, ProposalPhase::Proposed)).await;
    mesh.node("y").reject(thread_id).await.unwrap();

    let x = mesh.node("x");
    eventually("x to see the rejection", || x.phase(thread_id).ok() == Some(ProposalPhase::Rejected)).await;

    let replacement = x
        .propose(thread_id, ChangeKind::AddParticipants, &[party("w")], &[])
        .await
        .unwrap();
    let live = x.proposals(thread_id).unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].id, replacement.id);
}

#[tokio::test]
async fn non_members_cannot_propose() {
    let mesh = Mesh::new(&["x", "y", "w"]).await;
    let thread_id = thread(&mesh, "x", &["y"]).await;

    let err = mesh.node("w").propose(thread_id, ChangeKind::Close, &[], &[]).await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));

    let stranger: Vec<Party> = parties(&["v"]);
    let err = mesh
        .node("y")
        .propose(thread_id, ChangeKind::RemoveParticipants, &[], &stranger)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidActionArguments(_)));
}
