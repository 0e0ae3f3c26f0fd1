//! 静的評価
//!
//! 評価値は常に先手視点で、駒割 + KPP/KKP の位置評価からなる。
//! 位置評価の生の和は `POSITIONAL_SCALE` 分の1にスケールされる。
//!
//! 重みテーブルは RwLock で包むが、更新は駆動スレッドがワーカーの
//! 停止中にのみ行うという段階的な規約があるため、読み側の競合はない。

mod cache;
pub mod feature;
mod fv;
mod material;

pub use cache::EvalCache;
pub use fv::{kkp_index, kpp_index, Fv, FE_PAIR, KKP_ALL, KPP_ALL};
pub use material::{material_slot, Material, MATERIAL_COUNT};

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{Context, Result};

use crate::position::Position;
use crate::types::{Color, PieceType, Square, Value};
use feature::FeatureSet;

/// 位置評価のスケール（生の和 / 32 が評価値に加わる）
pub const POSITIONAL_SCALE: i32 = 32;

pub struct Evaluator {
    weights: RwLock<Fv<i16>>,
    pub material: Material,
    cache: EvalCache,
}

impl Evaluator {
    /// ゼロ初期化の評価器を作る
    pub fn new() -> Evaluator {
        Evaluator {
            weights: RwLock::new(Fv::new()),
            material: Material::new(),
            cache: EvalCache::new(1 << 18),
        }
    }

    /// 静的評価（先手視点）
    pub fn evaluate(&self, pos: &Position) -> Value {
        if let Some(v) = self.cache.probe(pos.hash()) {
            return Value::new(v);
        }
        let v = self.material_sum(pos) + self.positional_sum(pos) / POSITIONAL_SCALE;
        self.cache.store(pos.hash(), v);
        Value::new(v)
    }

    /// 駒割の和（先手視点）
    pub fn material_sum(&self, pos: &Position) -> i32 {
        let mut sum = 0i32;
        for sq in Square::all() {
            let pc = pos.piece_on(sq);
            if pc.is_none() || pc.piece_type() == PieceType::King {
                continue;
            }
            let v = self.material.value(pc.piece_type());
            sum += if pc.color() == Color::Black { v } else { -v };
        }
        for pt in PieceType::HAND_PIECES {
            let v = self.material.value(pt);
            sum += v * pos.hand_count(Color::Black, pt) as i32;
            sum -= v * pos.hand_count(Color::White, pt) as i32;
        }
        sum
    }

    /// KPP/KKP の生の和（スケール前、先手視点)
    fn positional_sum(&self, pos: &Position) -> i32 {
        let fs = FeatureSet::collect(pos);
        let kb = fs.king_b.index();
        let kw = fs.king_w.index();
        let kw_inv = fs.king_w.inverse().index();
        let w = self.weights.read().unwrap();

        let mut sum = 0i32;
        for i in 0..fs.list0.len() {
            for j in 0..i {
                sum += w.kpp[kpp_index(kb, fs.list0[i], fs.list0[j])] as i32;
                sum -= w.kpp[kpp_index(kw_inv, fs.list1[i], fs.list1[j])] as i32;
            }
            sum += w.kkp[kkp_index(kb, kw, fs.list0[i])] as i32;
        }
        sum
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn weights(&self) -> RwLockReadGuard<'_, Fv<i16>> {
        self.weights.read().unwrap()
    }

    /// ワーカー停止中にのみ呼ぶこと
    pub fn weights_mut(&self) -> RwLockWriteGuard<'_, Fv<i16>> {
        self.weights.write().unwrap()
    }

    /// 重みテーブルを書き出す（kpp, kkp の順に i16 little-endian）
    pub fn write_file(&self, path: &Path) -> Result<()> {
        let f = File::create(path)
            .with_context(|| format!("cannot create eval file: {}", path.display()))?;
        let mut w = BufWriter::with_capacity(1 << 20, f);
        let weights = self.weights();
        write_i16s(&mut w, &weights.kpp)?;
        write_i16s(&mut w, &weights.kkp)?;
        w.flush()?;
        log::debug!("saved eval weights to {}", path.display());
        Ok(())
    }

    /// `write_file` の逆変換
    pub fn load_file(&self, path: &Path) -> Result<()> {
        let f = File::open(path)
            .with_context(|| format!("cannot open eval file: {}", path.display()))?;
        let mut r = BufReader::with_capacity(1 << 20, f);
        let mut weights = self.weights_mut();
        read_i16s(&mut r, &mut weights.kpp)
            .with_context(|| format!("broken eval file (kpp): {}", path.display()))?;
        read_i16s(&mut r, &mut weights.kkp)
            .with_context(|| format!("broken eval file (kkp): {}", path.display()))?;
        drop(weights);
        self.clear_cache();
        Ok(())
    }
}

impl Default for Evaluator {
    fn default() -> Self {
        Evaluator::new()
    }
}

fn write_i16s(w: &mut impl Write, vals: &[i16]) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(8192 * 2);
    for chunk in vals.chunks(8192) {
        buf.clear();
        for v in chunk {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        w.write_all(&buf)?;
    }
    Ok(())
}

fn read_i16s(r: &mut impl Read, vals: &mut [i16]) -> std::io::Result<()> {
    let mut buf = vec![0u8; 8192 * 2];
    for chunk in vals.chunks_mut(8192) {
        let bytes = &mut buf[..chunk.len() * 2];
        r.read_exact(bytes)?;
        for (i, v) in chunk.iter_mut().enumerate() {
            *v = i16::from_le_bytes([bytes[i * 2], bytes[i * 2 + 1]]);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_position_is_even() {
        let eval = Evaluator::new();
        let pos = Position::initial();
        assert_eq!(eval.evaluate(&pos).raw(), 0);
    }

    #[test]
    fn test_material_sum_counts_hands() {
        let eval = Evaluator::new();
        let mut pos = Position::initial();
        pos.set_hand(Color::Black, PieceType::Rook, 1);
        pos.rebuild_hash();
        assert_eq!(eval.material_sum(&pos), 990);
    }

    #[test]
    fn test_positional_weights_move_eval() {
        let eval = Evaluator::new();
        let pos = Position::initial();
        let fs = FeatureSet::collect(&pos);
        let kb = fs.king_b.index();
        let kw_inv = fs.king_w.inverse().index();

        {
            let mut w = eval.weights_mut();
            // 先手視点のペア: POSITIONAL_SCALE 点で評価値 +1
            w.kpp[kpp_index(kb, fs.list0[1], fs.list0[0])] = POSITIONAL_SCALE as i16;
        }
        eval.clear_cache();
        assert_eq!(eval.evaluate(&pos).raw(), 1);

        {
            let mut w = eval.weights_mut();
            // 後手視点のペアは同じ大きさで打ち消す
            w.kpp[kpp_index(kw_inv, fs.list1[1], fs.list1[0])] = POSITIONAL_SCALE as i16;
        }
        eval.clear_cache();
        assert_eq!(eval.evaluate(&pos).raw(), 0);
    }

    #[test]
    fn test_extract_matches_evaluate_direction() {
        // extract が正の勾配を入れたセルを重みに足すと評価値が上がる
        let eval = Evaluator::new();
        let pos = Position::initial();
        let mut g = Fv::<f32>::new();
        g.extract(&pos, 1.0);

        let fs = FeatureSet::collect(&pos);
        let kb = fs.king_b.index();
        let idx = kpp_index(kb, fs.list0[1], fs.list0[0]);
        assert!(g.kpp[idx] > 0.0);
        {
            let mut w = eval.weights_mut();
            w.kpp[idx] = (g.kpp[idx] as i32 * POSITIONAL_SCALE) as i16;
        }
        eval.clear_cache();
        assert!(eval.evaluate(&pos).raw() > 0);
    }

    #[test]
    fn test_cache_cleared_after_weight_change() {
        let eval = Evaluator::new();
        let pos = Position::initial();
        assert_eq!(eval.evaluate(&pos).raw(), 0);
        {
            let mut w = eval.weights_mut();
            let fs = FeatureSet::collect(&pos);
            w.kpp[kpp_index(fs.king_b.index(), fs.list0[1], fs.list0[0])] =
                POSITIONAL_SCALE as i16;
        }
        // キャッシュを消すまでは古い値が見える
        assert_eq!(eval.evaluate(&pos).raw(), 0);
        eval.clear_cache();
        assert_eq!(eval.evaluate(&pos).raw(), 1);
    }
}
