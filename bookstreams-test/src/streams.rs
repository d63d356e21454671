// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of bookstreams.
//
// bookstreams is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// bookstreams is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with bookstreams.  If
// not, see <http://www.gnu.org/licenses/>.

//! Activity stream scenarios.

use std::{collections::HashSet, sync::Arc};

use itertools::Itertools;
use libtest_mimic::Failed;
use tracing::debug;

use bookstreams::{
    entities::{Privacy, Status, StatusId, StatusType, User, UserId, WorkId},
    kv,
    streams::StreamKind,
};

use crate::{minutes_ago, World};

const A: UserId = UserId::new(1);
const B: UserId = UserId::new(2);
const C: UserId = UserId::new(3);
const D: UserId = UserId::new(4);
const X: UserId = UserId::new(5);
const Y: UserId = UserId::new(6);

fn local_users(world: &World, users: &[UserId]) {
    users
        .iter()
        .for_each(|u| world.db.add_user(User::new(*u, true, true, true)));
}

/// Write `status` to the database & announce it
async fn post(world: &World, status: Status) -> Result<(), Failed> {
    world.db.add_status(status.clone());
    world.notifier.notify_status_created(&status).await?;
    Ok(())
}

/// A gains follower B: B's Home picks up A's existing posts (those B may see), newest first
pub async fn follow_backfills_home(kv: Arc<dyn kv::Backend + Send + Sync>) -> Result<(), Failed> {
    let world = World::new(kv, 200).await?;
    local_users(&world, &[A, B]);
    let posts = [
        (1, Privacy::Public, 30),
        (2, Privacy::Unlisted, 20),
        (3, Privacy::Followers, 10),
        (4, Privacy::Direct, 5),
    ];
    for (id, privacy, ago) in posts {
        post(
            &world,
            Status::new(StatusId::new(id), A, privacy, StatusType::Note).published_at(minutes_ago(ago)),
        )
        .await?;
    }
    world.settle().await?;
    assert!(world.timeline(B, StreamKind::Home).await?.is_empty());

    world.db.follow(&B, &A);
    world.notifier.notify_user_followed(&B, &A).await?;
    world.settle().await?;
    assert_eq!(
        world.timeline(B, StreamKind::Home).await?,
        vec![StatusId::new(3), StatusId::new(2), StatusId::new(1)]
    );
    // Backfill doesn't count as unread
    assert_eq!(
        world.fanout.get_unread_count(&B, StreamKind::Home).await?,
        0
    );

    world.db.unfollow(&B, &A);
    world.notifier.notify_user_unfollowed(&B, &A).await?;
    world.settle().await?;
    assert!(world.timeline(B, StreamKind::Home).await?.is_empty());

    world.shutdown().await
}

/// A followers-only status reaches exactly A & A's followers
pub async fn followers_only_audience(
    kv: Arc<dyn kv::Backend + Send + Sync>,
) -> Result<(), Failed> {
    let world = World::new(kv, 200).await?;
    local_users(&world, &[A, B, C, D]);
    world.db.follow(&B, &A);
    world.db.follow(&C, &A);
    let i = Status::new(StatusId::new(1), A, Privacy::Followers, StatusType::Note);
    post(&world, i.clone()).await?;
    world.settle().await?;

    for user in [A, B, C] {
        assert_eq!(world.timeline(user, StreamKind::Home).await?, vec![i.id]);
    }
    assert!(world.timeline(D, StreamKind::Home).await?.is_empty());
    for user in [A, B, C, D] {
        assert!(world.timeline(user, StreamKind::Local).await?.is_empty());
        assert!(world.timeline(user, StreamKind::Federated).await?.is_empty());
    }

    world.shutdown().await
}

/// Blocks remove each party's statuses from the other's streams; unblocking restores only the
/// public streams
pub async fn block_and_unblock(kv: Arc<dyn kv::Backend + Send + Sync>) -> Result<(), Failed> {
    let world = World::new(kv, 200).await?;
    local_users(&world, &[A, B]);
    world.db.follow(&B, &A);
    let a1 = Status::new(StatusId::new(1), A, Privacy::Public, StatusType::Note)
        .published_at(minutes_ago(10));
    let b1 = Status::new(StatusId::new(2), B, Privacy::Public, StatusType::Note)
        .published_at(minutes_ago(5));
    post(&world, a1.clone()).await?;
    post(&world, b1.clone()).await?;
    world.settle().await?;
    assert_eq!(world.timeline(B, StreamKind::Home).await?, vec![b1.id, a1.id]);
    assert_eq!(world.timeline(B, StreamKind::Local).await?, vec![b1.id, a1.id]);

    world.db.block(&A, &B);
    world.notifier.notify_user_blocked(&A, &B).await?;
    world.settle().await?;
    for kind in StreamKind::all() {
        assert!(!world.timeline(B, kind).await?.contains(&a1.id));
        assert!(!world.timeline(A, kind).await?.contains(&b1.id));
    }

    world.db.unblock(&A, &B);
    world.notifier.notify_user_unblocked(&A, &B).await?;
    world.settle().await?;
    for kind in [StreamKind::Local, StreamKind::Federated] {
        assert_eq!(world.timeline(B, kind).await?, vec![b1.id, a1.id]);
        assert_eq!(world.timeline(A, kind).await?, vec![b1.id, a1.id]);
    }
    // The block severed B's follow of A, and unblocking doesn't restore it
    assert_eq!(world.timeline(B, StreamKind::Home).await?, vec![b1.id]);

    world.shutdown().await
}

/// Each boost supersedes the original & every earlier boost
pub async fn boosts_supersede(kv: Arc<dyn kv::Backend + Send + Sync>) -> Result<(), Failed> {
    let world = World::new(kv, 200).await?;
    local_users(&world, &[A, B, X, Y]);
    for followee in [A, X, Y] {
        world.db.follow(&B, &followee);
    }
    let i = Status::new(StatusId::new(1), A, Privacy::Public, StatusType::Note)
        .published_at(minutes_ago(30));
    let bx = Status::new(StatusId::new(2), X, Privacy::Public, StatusType::Boost)
        .boosting(i.id)
        .published_at(minutes_ago(20));
    let by = Status::new(StatusId::new(3), Y, Privacy::Public, StatusType::Boost)
        .boosting(i.id)
        .published_at(minutes_ago(10));
    post(&world, i.clone()).await?;
    post(&world, bx.clone()).await?;
    post(&world, by.clone()).await?;
    world.settle().await?;

    let home = world
        .fanout
        .catalog()
        .get_timeline_with_scores(&B, StreamKind::Home)
        .await?;
    debug!("B's home: {:?}", home);
    assert_eq!(home.len(), 1);
    assert_eq!(home[0].0, by.id);
    assert_eq!(home[0].1, bookstreams::streams::rank(&by));

    // Deleting the boost brings the original back
    world.db.purge_status(&by.id);
    world.notifier.notify_boost_deleted(&by.id, &i.id).await?;
    world.settle().await?;
    let home = world.timeline(B, StreamKind::Home).await?;
    assert!(home.contains(&i.id));
    assert!(!home.contains(&by.id));

    world.shutdown().await
}

/// Unread counts go up by one per status fanned out to the user, and down to zero only when the
/// stream's marked read
pub async fn unread_counts(kv: Arc<dyn kv::Backend + Send + Sync>) -> Result<(), Failed> {
    let world = World::new(kv, 200).await?;
    local_users(&world, &[A, B, D]);
    world.db.follow(&B, &A);
    assert_eq!(world.fanout.get_unread_count(&B, StreamKind::Home).await?, 0);

    for id in 1..=3 {
        let status_type = if id == 3 {
            StatusType::Review
        } else {
            StatusType::Note
        };
        post(
            &world,
            Status::new(StatusId::new(id), A, Privacy::Followers, status_type),
        )
        .await?;
    }
    world.settle().await?;
    assert_eq!(world.fanout.get_unread_count(&B, StreamKind::Home).await?, 3);
    assert_eq!(world.fanout.get_unread_count(&D, StreamKind::Home).await?, 0);
    let by_type = world
        .fanout
        .get_unread_count_by_type(&B, StreamKind::Home)
        .await?;
    assert_eq!(by_type.get(&StatusType::Note), Some(&2));
    assert_eq!(by_type.get(&StatusType::Review), Some(&1));

    // Reading doesn't reset anything
    world.timeline(B, StreamKind::Home).await?;
    assert_eq!(world.fanout.get_unread_count(&B, StreamKind::Home).await?, 3);

    world.fanout.mark_read(&B, StreamKind::Home).await?;
    assert_eq!(world.fanout.get_unread_count(&B, StreamKind::Home).await?, 0);
    assert!(world
        .fanout
        .get_unread_count_by_type(&B, StreamKind::Home)
        .await?
        .is_empty());

    post(
        &world,
        Status::new(StatusId::new(4), A, Privacy::Followers, StatusType::Note),
    )
    .await?;
    world.settle().await?;
    assert_eq!(world.fanout.get_unread_count(&B, StreamKind::Home).await?, 1);

    world.shutdown().await
}

/// Rebuilding a stream from the database yields what fan-out produced
pub async fn rebuild_equivalence(kv: Arc<dyn kv::Backend + Send + Sync>) -> Result<(), Failed> {
    let world = World::new(kv, 200).await?;
    local_users(&world, &[A, B, C]);
    world.db.add_user(User::new(D, false, true, true));
    world.db.follow(&B, &A);
    world.db.follow(&C, &D);
    let work = WorkId::new(100);
    world.db.shelve(&B, &work);

    let privacies = [Privacy::Public, Privacy::Unlisted, Privacy::Followers];
    let types = [StatusType::Note, StatusType::Review, StatusType::Comment];
    let mut id = 0;
    for (author, privacy, status_type) in itertools::iproduct!([A, C, D], privacies, types) {
        id += 1;
        let mut status = Status::new(StatusId::new(id), author, privacy, status_type)
            .published_at(minutes_ago(1000 - id as i64));
        if status_type != StatusType::Note {
            status = status.about(work);
        }
        post(&world, status).await?;
    }
    world.settle().await?;
    for gone in [3, 7, 11] {
        world.db.delete_status(&StatusId::new(gone));
        world.notifier.notify_status_deleted(&StatusId::new(gone)).await?;
    }
    world.settle().await?;

    let catalog = world.fanout.catalog();
    for (user, kind) in itertools::iproduct!([A, B, C], StreamKind::all()) {
        let fanned_out = world
            .timeline(user, kind)
            .await?
            .into_iter()
            .collect::<HashSet<_>>();
        catalog.populate_store(kind, &user).await?;
        let rebuilt = world
            .timeline(user, kind)
            .await?
            .into_iter()
            .collect::<HashSet<_>>();
        assert_eq!(
            fanned_out,
            rebuilt,
            "{user}'s {kind} differs: {:?}",
            fanned_out.symmetric_difference(&rebuilt).sorted().collect::<Vec<_>>()
        );
    }

    world.shutdown().await
}

/// Streams never exceed their capacity & retain the highest-ranked statuses
pub async fn capacity(kv: Arc<dyn kv::Backend + Send + Sync>) -> Result<(), Failed> {
    let world = World::new(kv, 5).await?;
    local_users(&world, &[A, B]);
    world.db.follow(&B, &A);
    for id in 1..=12 {
        post(
            &world,
            Status::new(StatusId::new(id), A, Privacy::Public, StatusType::Note)
                .published_at(minutes_ago(100 - id as i64)),
        )
        .await?;
    }
    world.settle().await?;
    let expected = (8..=12).rev().map(StatusId::new).collect::<Vec<_>>();
    for kind in [StreamKind::Home, StreamKind::Local, StreamKind::Federated] {
        assert_eq!(world.timeline(B, kind).await?, expected);
    }
    // Unread counts aren't bounded by capacity
    assert_eq!(world.fanout.get_unread_count(&B, StreamKind::Home).await?, 12);

    world.shutdown().await
}
