//! オンライン学習の結合テスト

use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use shiden_core::eval::{kpp_index, Evaluator};
use shiden_core::position::Position;
use shiden_core::types::{Color, File, Move, Piece, PieceType, Rank, Square};
use shiden_learn::online::{OnlineJob, OnlineLearning, MINI_BATCH_LENGTH};
use shiden_learn::LearnConfig;

fn sq(f: File, r: Rank) -> Square {
    Square::new(f, r)
}

/// 先手の合法手が玉の1手（9八へ）しかない局面
fn one_move_job() -> OnlineJob {
    let mut pos = Position::empty();
    pos.put(sq(File::File9, Rank::Rank9), Piece::new(Color::Black, PieceType::King));
    pos.put(sq(File::File5, Rank::Rank1), Piece::new(Color::White, PieceType::King));
    pos.put(sq(File::File8, Rank::Rank1), Piece::new(Color::White, PieceType::Rook));
    pos.rebuild_hash();
    OnlineJob {
        board: pos.to_compact(),
        expert: Move::new_move(
            sq(File::File9, Rank::Rank9),
            sq(File::File9, Rank::Rank8),
            false,
        ),
    }
}

/// 教師手（金を2二へ）が1手詰めになる局面
fn mate_in_one_job() -> OnlineJob {
    let mut pos = Position::empty();
    pos.put(sq(File::File9, Rank::Rank9), Piece::new(Color::Black, PieceType::King));
    pos.put(sq(File::File1, Rank::Rank1), Piece::new(Color::White, PieceType::King));
    pos.put(sq(File::File2, Rank::Rank3), Piece::new(Color::Black, PieceType::Gold));
    pos.put(sq(File::File3, Rank::Rank4), Piece::new(Color::Black, PieceType::Knight));
    pos.rebuild_hash();
    OnlineJob {
        board: pos.to_compact(),
        expert: Move::new_move(
            sq(File::File2, Rank::Rank3),
            sq(File::File2, Rank::Rank2),
            false,
        ),
    }
}

#[test]
fn mini_batch_drain_and_averaged_identity() {
    let dir = tempfile::tempdir().unwrap();
    let config = LearnConfig {
        kifu_dir: dir.path().join("kifu"),
        threads: 2,
        depth: 1,
        eval_file: dir.path().join("eval.bin"),
        material_file: dir.path().join("material.bin"),
        training_file: dir.path().join("training.dat"),
        seed: 11,
        log_json: None,
        ..LearnConfig::default()
    };
    let eval = Arc::new(Evaluator::new());
    let mut learner = OnlineLearning::new(config, Arc::clone(&eval)).unwrap();

    // バッチに満たない間は何も起きない
    for _ in 0..MINI_BATCH_LENGTH - 1 {
        learner.push_job(one_move_job());
    }
    assert!(!learner.mini_batch().unwrap());
    assert_eq!(learner.mini_batch_count(), 1);
    assert_eq!(learner.remaining_jobs(), MINI_BATCH_LENGTH - 1);

    // どのジョブも勾配を落とさない（合法手1つ / 教師手が詰み）ので
    // 平均化パーセプトロンの恒等式を事前に仕込んだセルで確かめられる
    learner.push_job(mate_in_one_job());
    let idx = kpp_index(0, 10, 3);
    {
        let (w, u) = learner.raw_fvs_mut();
        w.kpp[idx] = 5.3;
        u.kpp[idx] = 2.0;
    }

    learner.start_workers().unwrap();
    let advanced = learner.mini_batch().unwrap();
    learner.stop_workers();

    // ちょうど1バッチ分を全て消費して1回だけ進む
    assert!(advanced);
    assert_eq!(learner.remaining_jobs(), 0);
    assert_eq!(learner.mini_batch_count(), 2);

    // 勾配ゼロのセルは正則化項の分だけ動き、公開値は round(w - u/t)
    let n = 1.0e-6f32 * 32.0;
    let w1 = 5.3 - n;
    let u1 = 2.0 - n;
    let expect = (w1 - u1 / 2.0).round() as i16;
    assert_eq!(expect, 4);

    let mut f = std::fs::File::open(dir.path().join("eval.bin")).unwrap();
    f.seek(SeekFrom::Start((idx * 2) as u64)).unwrap();
    let mut bytes = [0u8; 2];
    f.read_exact(&mut bytes).unwrap();
    assert_eq!(i16::from_le_bytes(bytes), expect);

    // メモリ上の重みは最新値 round(w)
    assert_eq!(eval.weights().kpp[idx], 5);

    // 触れていないセルはゼロのまま
    assert_eq!(eval.weights().kpp[kpp_index(40, 500, 100)], 0);
    assert_eq!(eval.weights().kkp[0], 0);
}
