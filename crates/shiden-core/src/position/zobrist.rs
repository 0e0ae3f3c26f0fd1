//! Zobrist ハッシュ

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::LazyLock;

use crate::types::{Color, Piece, Square};

pub struct Zobrist {
    /// [piece.raw()][sq]
    pub psq: [[u64; Square::NUM]; Piece::NUM],
    /// [color][piece_type(1..=7)][count(0..=18)]
    pub hand: [[[u64; 19]; 8]; 2],
    /// 後手番のとき xor する
    pub side: u64,
}

/// テーブルは再現性のため固定シードで生成する
pub static ZOBRIST: LazyLock<Zobrist> = LazyLock::new(|| {
    let mut rng = ChaCha8Rng::seed_from_u64(0x5194_11de);
    let mut psq = [[0u64; Square::NUM]; Piece::NUM];
    for row in psq.iter_mut().skip(1) {
        for v in row.iter_mut() {
            *v = rng.random();
        }
    }
    let mut hand = [[[0u64; 19]; 8]; 2];
    for per_color in hand.iter_mut() {
        for per_pt in per_color.iter_mut().skip(1) {
            // count=0 は 0 のままにしておく（持っていない状態が基準）
            for v in per_pt.iter_mut().skip(1) {
                *v = rng.random();
            }
        }
    }
    Zobrist {
        psq,
        hand,
        side: rng.random(),
    }
});

#[inline]
pub fn psq_key(piece: Piece, sq: Square) -> u64 {
    ZOBRIST.psq[piece.raw() as usize][sq.index()]
}

#[inline]
pub fn hand_key(color: Color, pt_raw: usize, count: u8) -> u64 {
    ZOBRIST.hand[color.index()][pt_raw][count as usize]
}
