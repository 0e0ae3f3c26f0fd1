//! 指し手生成
//!
//! 盤上の駒の移動（成り・不成の両方）と持ち駒の打ちを列挙する。
//! `generate` は擬似合法手（自玉の安全を除く制約は満たす）を生成し、
//! `legal_moves` は `Position::do_move` による検査で合法手のみに絞る。
//! 打ち歩詰めは検査しない。

use crate::position::{
    in_promotion_zone, is_dead_square, offset_square, slides_of, steps_of, Position,
};
use crate::types::{Color, File, Move, PieceType, Rank, Square};

pub struct MoveGen;

impl MoveGen {
    /// 擬似合法手を `out` に追加する
    pub fn generate(pos: &Position, out: &mut Vec<Move>) {
        let us = pos.side_to_move();
        for from in Square::all() {
            let pc = pos.piece_on(from);
            if pc.is_none() || pc.color() != us {
                continue;
            }
            let pt = pc.piece_type();
            for &(df, dr) in steps_of(pt, us) {
                if let Some(to) = offset_square(from, df, dr) {
                    Self::push_board_move(pos, us, pt, from, to, out);
                }
            }
            for &(df, dr) in slides_of(pt, us) {
                let mut k = 1;
                while let Some(to) = offset_square(from, df * k, dr * k) {
                    let occ = pos.piece_on(to);
                    if occ.is_some() && occ.color() == us {
                        break;
                    }
                    Self::push_board_move(pos, us, pt, from, to, out);
                    if occ.is_some() {
                        break;
                    }
                    k += 1;
                }
            }
        }
        Self::generate_drops(pos, us, out);
    }

    fn push_board_move(
        pos: &Position,
        us: Color,
        pt: PieceType,
        from: Square,
        to: Square,
        out: &mut Vec<Move>,
    ) {
        let occ = pos.piece_on(to);
        if occ.is_some() && (occ.color() == us || occ.piece_type() == PieceType::King) {
            return;
        }
        let can_promote =
            pt.can_promote() && (in_promotion_zone(us, from) || in_promotion_zone(us, to));
        if can_promote {
            out.push(Move::new_move(from, to, true));
        }
        if !is_dead_square(us, pt, to) {
            out.push(Move::new_move(from, to, false));
        }
    }

    fn generate_drops(pos: &Position, us: Color, out: &mut Vec<Move>) {
        for pt in PieceType::HAND_PIECES {
            if pos.hand_count(us, pt) == 0 {
                continue;
            }
            for f in 0..9 {
                let file = File::from_index(f).unwrap();
                if pt == PieceType::Pawn && pos.pawn_on_file(us, file) {
                    continue;
                }
                for r in 0..9 {
                    let to = Square::new(file, Rank::from_index(r).unwrap());
                    if pos.piece_on(to).is_some() || is_dead_square(us, pt, to) {
                        continue;
                    }
                    out.push(Move::new_drop(pt, to));
                }
            }
        }
    }

    /// 合法手のみを返す
    pub fn legal_moves(pos: &mut Position) -> Vec<Move> {
        let mut moves = Vec::with_capacity(128);
        Self::generate(pos, &mut moves);
        moves.retain(|&m| {
            if let Some(undo) = pos.do_move(m) {
                pos.undo_move(m, undo);
                true
            } else {
                false
            }
        });
        moves
    }
}
