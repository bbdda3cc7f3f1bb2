//! A Rank index supports rank-of-member and member-at-rank lookups that
//! stay in agreement as scores come and go, the way a game leaderboard uses
//! them.

use rlayer_core::index::{self, rank, IndexUpdate};
use rlayer_core::kv::memory::MemoryDatabase;
use rlayer_core::kv::KvDatabase;
use rlayer_core::record::{Expression, IndexDescriptor, IndexKind, TieBreak};
use rlayer_core::store::StoreKeys;
use rlayer_core::tuple::{Element, Subspace, Tuple};

fn descriptor() -> IndexDescriptor {
    IndexDescriptor {
        name: "leaderboard".into(),
        kind: IndexKind::Rank { tie_break: TieBreak::PrimaryKey },
        root_expression: Expression::field("score"),
        applies_to_types: vec!["Player".into()],
        covering_fields: vec![],
    }
}

fn pk(id: i64) -> Tuple {
    Tuple::from_elements(vec![Element::Int(id)])
}

fn score(v: i64) -> Tuple {
    Tuple::from_elements(vec![Element::Int(v)])
}

#[test]
fn leaderboard_rank_tracks_score_changes() {
    let db = MemoryDatabase::new();
    let keys = StoreKeys::new(Subspace::new(b"s".to_vec()));
    let desc = descriptor();
    let mut tx = db.begin();

    let players = [(1, 1200), (2, 900), (3, 1500), (4, 1100)];
    for (id, s) in players {
        index::maintain(
            &mut tx,
            &keys,
            &desc,
            &IndexUpdate { primary_key: &pk(id), old_entries: &[], new_entries: &[score(s)], old_covering: None, new_covering: None },
        )
        .unwrap();
    }

    // Ascending by score: 900, 1100, 1200, 1500 -> players 2, 4, 1, 3.
    let last_place = rank::select(&mut tx, &keys, "leaderboard", 0).unwrap().unwrap();
    assert_eq!(last_place, score(900).concat(pk(2)));
    let first_place = rank::select(&mut tx, &keys, "leaderboard", 3).unwrap().unwrap();
    assert_eq!(first_place, score(1500).concat(pk(3)));

    // Player 2 has a big win, overtaking everyone.
    index::maintain(
        &mut tx,
        &keys,
        &desc,
        &IndexUpdate { primary_key: &pk(2), old_entries: &[score(900)], new_entries: &[score(1600)], old_covering: None, new_covering: None },
    )
    .unwrap();

    let new_last_place = rank::select(&mut tx, &keys, "leaderboard", 0).unwrap().unwrap();
    assert_eq!(new_last_place, score(1100).concat(pk(4)));
    let new_first_place = rank::select(&mut tx, &keys, "leaderboard", 3).unwrap().unwrap();
    assert_eq!(new_first_place, score(1600).concat(pk(2)));
    assert_eq!(rank::rank(&mut tx, &keys, "leaderboard", &new_first_place).unwrap(), Some(3));

    db.commit(tx).unwrap();
}
