//! 固定深さのアルファベータ探索
//!
//! 学習器が教師PVと兄弟PVを得るための軽量な探索器。駒割+KPP/KKPの
//! 静的評価を葉で呼び、取る手のみの静止探索を付ける。`learning` が
//! 立っている場合は置換表を一切参照しない。

use std::sync::Arc;

use crate::eval::Evaluator;
use crate::movegen::MoveGen;
use crate::position::Position;
use crate::types::{Color, Move, Value};

/// 「from or 打ち駒種」×「to」の組み合わせ総数
const FROM_TO_SIZE: usize = (81 + 7) * 81;

/// 探索設定
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// 基本探索深さ
    pub max_depth: i32,
    /// 学習モード（置換表を使わない）
    pub learning: bool,
    /// 置換表のエントリ数（2のべき乗）
    pub tt_size_pow2: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            max_depth: 2,
            learning: false,
            tt_size_pow2: 1 << 16,
        }
    }
}

/// 探索結果
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    /// 読み筋（先頭が最善手）
    pub pv: Vec<Move>,
    /// ルート手番視点の評価値
    pub value: Value,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Bound {
    Exact,
    Lower,
    Upper,
}

#[derive(Clone, Copy)]
struct TtEntry {
    key: u64,
    value: i32,
    depth: i8,
    bound: Bound,
    best: Move,
}

struct Tt {
    table: Vec<Option<TtEntry>>,
    mask: usize,
}

impl Tt {
    fn new(size_pow2: usize) -> Tt {
        debug_assert!(size_pow2.is_power_of_two());
        Tt {
            table: vec![None; size_pow2],
            mask: size_pow2 - 1,
        }
    }

    #[inline]
    fn probe(&self, key: u64) -> Option<TtEntry> {
        self.table[key as usize & self.mask].filter(|e| e.key == key)
    }

    #[inline]
    fn store(&mut self, e: TtEntry) {
        self.table[e.key as usize & self.mask] = Some(e);
    }

    fn clear(&mut self) {
        self.table.fill(None);
    }
}

pub struct Searcher {
    eval: Arc<Evaluator>,
    config: SearchConfig,
    history: Vec<i32>,
    tt: Tt,
}

impl Searcher {
    pub fn new(eval: Arc<Evaluator>, config: SearchConfig) -> Searcher {
        let tt = Tt::new(config.tt_size_pow2);
        Searcher {
            eval,
            config,
            history: vec![0; FROM_TO_SIZE],
            tt,
        }
    }

    /// 探索深さを差し替える
    pub fn set_depth(&mut self, depth: i32) {
        self.config.max_depth = depth;
    }

    /// history ヒューリスティックを消す
    pub fn clear_history(&mut self) {
        self.history.fill(0);
    }

    /// 置換表を消す
    pub fn clear_tt(&mut self) {
        self.tt.clear();
    }

    /// `(alpha, beta)` の窓で固定深さ探索を行う
    pub fn search(&mut self, pos: &mut Position, alpha: Value, beta: Value) -> SearchOutcome {
        let mut pv = Vec::new();
        let value = self.negamax(
            pos,
            self.config.max_depth,
            alpha.raw(),
            beta.raw(),
            0,
            &mut pv,
        );
        SearchOutcome {
            pv,
            value: Value::new(value),
        }
    }

    /// 全窓の固定深さ探索
    pub fn search_full(&mut self, pos: &mut Position) -> SearchOutcome {
        self.search(pos, -Value::INFINITE, Value::INFINITE)
    }

    fn static_eval(&self, pos: &Position) -> i32 {
        let v = self.eval.evaluate(pos).raw();
        if pos.side_to_move() == Color::Black {
            v
        } else {
            -v
        }
    }

    fn move_score(&self, pos: &Position, m: Move) -> i32 {
        let mut score = 0;
        if !m.is_drop() {
            let captured = pos.piece_on(m.to());
            if captured.is_some() {
                score += self.eval.material.exchange_value(captured.piece_type()) * 8;
            }
            if m.is_promote() {
                let pt = pos.piece_on(m.from()).piece_type();
                score += self.eval.material.promotion_gain(pt) * 8;
            }
        }
        score + self.history[m.history_index()]
    }

    fn negamax(
        &mut self,
        pos: &mut Position,
        depth: i32,
        mut alpha: i32,
        beta: i32,
        ply: i32,
        pv: &mut Vec<Move>,
    ) -> i32 {
        pv.clear();
        if depth <= 0 {
            return self.qsearch(pos, alpha, beta, ply);
        }

        let orig_alpha = alpha;
        let mut tt_move = Move::NONE;
        if !self.config.learning {
            if let Some(e) = self.tt.probe(pos.hash()) {
                tt_move = e.best;
                if e.depth as i32 >= depth && ply > 0 {
                    match e.bound {
                        Bound::Exact => return e.value,
                        Bound::Lower if e.value >= beta => return e.value,
                        Bound::Upper if e.value <= alpha => return e.value,
                        _ => {}
                    }
                }
            }
        }

        let mut moves = Vec::with_capacity(128);
        MoveGen::generate(pos, &mut moves);
        let mut scored: Vec<(i32, Move)> = moves
            .into_iter()
            .map(|m| {
                let bonus = if m == tt_move { i32::MAX / 2 } else { 0 };
                (self.move_score(pos, m) + bonus, m)
            })
            .collect();
        scored.sort_by_key(|&(s, _)| std::cmp::Reverse(s));

        let mut best = -Value::INFINITE.raw();
        let mut best_move = Move::NONE;
        let mut child_pv = Vec::new();
        let mut searched = 0;
        for (_, m) in scored {
            let undo = match pos.do_move(m) {
                Some(u) => u,
                None => continue,
            };
            searched += 1;
            let v = -self.negamax(pos, depth - 1, -beta, -alpha, ply + 1, &mut child_pv);
            pos.undo_move(m, undo);

            if v > best {
                best = v;
                best_move = m;
                pv.clear();
                pv.push(m);
                pv.extend_from_slice(&child_pv);
            }
            if v > alpha {
                alpha = v;
            }
            if alpha >= beta {
                self.history[m.history_index()] += depth * depth;
                break;
            }
        }

        if searched == 0 {
            // 合法手なし: 詰まされている
            return Value::mated_in(ply).raw();
        }

        if !self.config.learning {
            let bound = if best <= orig_alpha {
                Bound::Upper
            } else if best >= beta {
                Bound::Lower
            } else {
                Bound::Exact
            };
            self.tt.store(TtEntry {
                key: pos.hash(),
                value: best,
                depth: depth as i8,
                bound,
                best: best_move,
            });
        }

        best
    }

    /// 取る手のみの静止探索
    fn qsearch(&mut self, pos: &mut Position, mut alpha: i32, beta: i32, ply: i32) -> i32 {
        let stand_pat = self.static_eval(pos);
        if stand_pat >= beta {
            return stand_pat;
        }
        if stand_pat > alpha {
            alpha = stand_pat;
        }
        if ply >= 32 {
            return stand_pat;
        }

        let mut moves = Vec::with_capacity(32);
        MoveGen::generate(pos, &mut moves);
        let mut captures: Vec<(i32, Move)> = moves
            .into_iter()
            .filter(|m| !m.is_drop() && pos.piece_on(m.to()).is_some())
            .map(|m| (self.move_score(pos, m), m))
            .collect();
        captures.sort_by_key(|&(s, _)| std::cmp::Reverse(s));

        let mut best = stand_pat;
        for (_, m) in captures {
            let undo = match pos.do_move(m) {
                Some(u) => u,
                None => continue,
            };
            let v = -self.qsearch(pos, -beta, -alpha, ply + 1);
            pos.undo_move(m, undo);
            if v > best {
                best = v;
            }
            if v > alpha {
                alpha = v;
            }
            if alpha >= beta {
                break;
            }
        }
        best
    }
}
