//! Scripted thread lifecycle: create, chat, add a party, remove one, close.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::sync::broadcast;
use tracing::info;

use concord_engine::{Node, Quorum};
use concord_types::{ChangeEvent, ChangeKind, Command, ThreadId};

const STEP_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn run(nodes: &[Node]) -> Result<()> {
    let [admin, member, newcomer, ..] = nodes else {
        bail!("the scripted lifecycle needs three parties");
    };
    let mut newcomer_events = newcomer.notifier().subscribe();

    let meta = admin
        .create_thread(&[member.party().clone()], "launch", "Kicking off the launch thread.")
        .await?;
    let thread_id = meta.thread_id;
    info!("Thread {} created by {}", thread_id, admin.party());

    wait_until(|| member.thread(thread_id).is_ok()).await?;
    member.send_message(thread_id, "re: launch", "Ready when you are.", None).await?;

    // Member brings in the newcomer; the admin agrees
    member
        .propose(thread_id, ChangeKind::AddParticipants, &[newcomer.party().clone()], &[])
        .await?;
    wait_until(|| !admin.proposals(thread_id).unwrap_or_default().is_empty()).await?;
    admin.agree(thread_id).await?;
    finalize_if_manual(member, thread_id).await?;
    wait_for(&mut newcomer_events, thread_id, Command::FinalizeParticipants).await?;
    info!(
        "{} joined with {} message(s) of history",
        newcomer.party(),
        newcomer.messages(thread_id)?.len()
    );

    newcomer.send_message(thread_id, "hello", "Thanks for the add.", None).await?;

    // Admin removes the member; the newcomer agrees
    let mut admin_events = admin.notifier().subscribe();
    admin
        .propose(thread_id, ChangeKind::RemoveParticipants, &[], &[member.party().clone()])
        .await?;
    wait_until(|| !newcomer.proposals(thread_id).unwrap_or_default().is_empty()).await?;
    newcomer.agree(thread_id).await?;
    finalize_if_manual(admin, thread_id).await?;
    wait_for(&mut admin_events, thread_id, Command::FinalizeParticipants).await?;
    wait_until(|| member.threads().map(|t| !t.contains(&thread_id)).unwrap_or(false)).await?;
    info!("{} removed, roster now {:?}", member.party(), admin.thread(thread_id)?.roster());

    // Close by agreement of the remaining two
    admin.propose(thread_id, ChangeKind::Close, &[], &[]).await?;
    wait_until(|| !newcomer.proposals(thread_id).unwrap_or_default().is_empty()).await?;
    newcomer.agree(thread_id).await?;
    finalize_if_manual(admin, thread_id).await?;
    wait_for(&mut newcomer_events, thread_id, Command::FinalizeClose).await?;

    info!("Thread {} closed; lifecycle complete", thread_id);
    Ok(())
}

/// With auto-finalize off, the proposer finalizes once it sees the quorum.
async fn finalize_if_manual(proposer: &Node, thread_id: ThreadId) -> Result<()> {
    if proposer.config().auto_finalize {
        return Ok(());
    }
    wait_until(|| proposer.evaluate(thread_id).ok() == Some(Quorum::Complete)).await?;
    proposer.finalize(thread_id).await?;
    Ok(())
}

async fn wait_for(events: &mut broadcast::Receiver<ChangeEvent>, thread_id: ThreadId, command: Command) -> Result<()> {
    tokio::time::timeout(STEP_TIMEOUT, async {
        loop {
            let event = events.recv().await?;
            if event.thread_id == thread_id && event.command == command {
                return Ok::<_, broadcast::error::RecvError>(());
            }
        }
    })
    .await
    .with_context(|| format!("timed out waiting for {} on thread {}", command, thread_id))??;
    Ok(())
}

async fn wait_until(check: impl Fn() -> bool) -> Result<()> {
    tokio::time::timeout(STEP_TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .context("timed out waiting for peers to catch up")
}
