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

//! Suggested-user scenarios.

use std::{collections::HashSet, sync::Arc};

use libtest_mimic::Failed;

use bookstreams::{
    entities::{User, UserId, WorkId},
    kv,
    suggested::{suggested_ids, SuggestionRank},
};

use crate::World;

const A: UserId = UserId::new(1);
const B: UserId = UserId::new(2);
const C: UserId = UserId::new(3);
const D: UserId = UserId::new(4);

/// Walk a small community through sign-up, follows, shelving, a block & a change of heart about
/// discoverability, checking A's suggestions along the way
pub async fn suggestion_lifecycle(kv: Arc<dyn kv::Backend + Send + Sync>) -> Result<(), Failed> {
    let world = World::new(kv, 200).await?;
    let work = WorkId::new(7);

    // Sign-ups are handled one at a time, so each new user is offered to everyone already here
    for user in [A, B, C, D] {
        world.db.add_user(User::new(user, true, true, true));
        world.notifier.notify_account_created(&user).await?;
        world.settle().await?;
    }
    for user in [A, B, C, D] {
        let expected = [A, B, C, D]
            .into_iter()
            .filter(|u| *u != user)
            .collect::<HashSet<_>>();
        assert_eq!(
            suggested_ids(&world.fanout.get_suggestions(&user, 5).await?),
            expected
        );
    }

    // A follows B, B follows C: B leaves A's list & C gains a mutual there
    world.db.follow(&A, &B);
    world.notifier.notify_user_followed(&A, &B).await?;
    world.settle().await?;
    world.db.follow(&B, &C);
    world.notifier.notify_user_followed(&B, &C).await?;
    world.settle().await?;

    world.db.shelve(&A, &work);
    world.notifier.notify_book_shelved(&A, &work).await?;
    world.settle().await?;
    world.db.shelve(&C, &work);
    world.notifier.notify_book_shelved(&C, &work).await?;
    world.settle().await?;

    assert_eq!(
        world.fanout.get_suggestions(&A, 5).await?,
        vec![(C, SuggestionRank::new(1, 1)), (D, SuggestionRank::new(0, 0))]
    );
    assert_eq!(world.fanout.get_suggestions(&A, 1).await?.len(), 1);

    // Blocks remove each party from the other's list
    world.db.block(&A, &D);
    world.notifier.notify_user_blocked(&A, &D).await?;
    world.settle().await?;
    assert_eq!(
        suggested_ids(&world.fanout.get_suggestions(&A, 5).await?),
        HashSet::from([C])
    );
    assert!(!suggested_ids(&world.fanout.get_suggestions(&D, 5).await?).contains(&A));

    // C opts out of being suggested...
    world.db.set_discoverable(&C, false);
    world.notifier.notify_discoverability_changed(&C).await?;
    world.settle().await?;
    assert!(world.fanout.get_suggestions(&A, 5).await?.is_empty());
    assert_eq!(
        suggested_ids(&world.fanout.get_suggestions(&B, 5).await?),
        HashSet::from([A, D])
    );

    // ...then back in; B already follows C, so C goes back to A & D only
    world.db.set_discoverable(&C, true);
    world.notifier.notify_discoverability_changed(&C).await?;
    world.settle().await?;
    assert_eq!(
        world.fanout.get_suggestions(&A, 5).await?,
        vec![(C, SuggestionRank::new(1, 1))]
    );
    assert!(!suggested_ids(&world.fanout.get_suggestions(&B, 5).await?).contains(&C));
    assert!(suggested_ids(&world.fanout.get_suggestions(&D, 5).await?).contains(&C));

    world.shutdown().await
}
