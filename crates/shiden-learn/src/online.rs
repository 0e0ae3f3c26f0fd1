//! オンライン学習（平均化パーセプトロン）
//!
//! (局面, 教師手) のジョブ列をシャッフルし、ミニバッチごとにワーカーで
//! 勾配を積んで重みを更新する。生の重み `w` と累積 `u` を浮動小数で
//! 持ち、公開する整数重みは `round(w - u/t)`（平均化）で、探索用には
//! `round(w)`（最新値）を書き戻す。

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use shiden_core::eval::{Evaluator, Fv, POSITIONAL_SCALE};
use shiden_core::movegen::MoveGen;
use shiden_core::position::{CompactBoard, Position};
use shiden_core::record::GameRecord;
use shiden_core::search::{SearchConfig, Searcher};
use shiden_core::types::{Color, Move, PieceType, Square};

use crate::config::LearnConfig;
use crate::corpus::enumerate_kifu;
use crate::logging::StructuredLogger;
use crate::pool::{JobQueue, POLL_INTERVAL};

/// ヒンジマージンの上限（兄弟手の窓の上側はこの幅）
pub const MAX_HINGE_MARGIN: i32 = 256;
/// ヒンジマージンの下限
pub const MIN_HINGE_MARGIN: i32 = 10;
/// 1局面あたりに探索する兄弟手の数
pub const NUMBER_OF_SIBLING_NODES: usize = 16;
/// ミニバッチのジョブ数
pub const MINI_BATCH_LENGTH: usize = 256;
/// L1正則化の強さ
const NORM: f32 = 1.0e-6;
/// 勾配の基本量
const GRADIENT: f32 = 4.0;

#[inline]
fn gradient_scale() -> f32 {
    GRADIENT * POSITIONAL_SCALE as f32
}

#[inline]
fn norm_pull(w: f32) -> f32 {
    let n = NORM * POSITIONAL_SCALE as f32;
    if w > 0.0 {
        -n
    } else if w < 0.0 {
        n
    } else {
        0.0
    }
}

/// 進行度の推定（0.0 = 序盤、1.0 = 終盤）
///
/// 持ち駒と成駒の量から単調に増える量。ヒンジマージンの
/// スケーリングにのみ使う。
pub fn progression(pos: &Position) -> f32 {
    let mut score = 0i32;
    for c in [Color::Black, Color::White] {
        for pt in PieceType::HAND_PIECES {
            score += 2 * pos.hand_count(c, pt) as i32;
        }
    }
    for sq in Square::all() {
        let pc = pos.piece_on(sq);
        if pc.is_some() && pc.piece_type().is_promoted() {
            score += 3;
        }
    }
    (score as f32 / 40.0).min(1.0)
}

/// 局面の進行度に応じたヒンジマージン
pub fn hinge_margin(pos: &Position) -> i32 {
    let prog = progression(pos);
    let margin = MIN_HINGE_MARGIN as f32 + (MAX_HINGE_MARGIN - MIN_HINGE_MARGIN) as f32 * prog;
    margin.round() as i32
}

/// オンライン学習の1ジョブ
#[derive(Clone)]
pub struct OnlineJob {
    pub board: CompactBoard,
    pub expert: Move,
}

struct OnlineShared {
    eval: Arc<Evaluator>,
    queue: JobQueue<OnlineJob>,
    grad: Mutex<Fv<f32>>,
    mini_batch_scale: AtomicU32,
    error_count: AtomicU32,
    error_sum: Mutex<f64>,
    /// ミニバッチ境界で上がる世代。ワーカーは変化を見たら置換表を消す。
    tt_generation: AtomicU32,
    depth: i32,
}

fn worker_main(shared: Arc<OnlineShared>, seed: u64) {
    let config = SearchConfig {
        max_depth: shared.depth,
        learning: true,
        tt_size_pow2: 1 << 10,
    };
    let mut searcher = Searcher::new(Arc::clone(&shared.eval), config);
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut seen_generation = shared.tt_generation.load(Ordering::Relaxed);

    while !shared.queue.is_shutdown() {
        std::thread::sleep(POLL_INTERVAL);
        let Some(job) = shared.queue.try_dequeue() else {
            continue;
        };
        let generation = shared.tt_generation.load(Ordering::Relaxed);
        if generation != seen_generation {
            searcher.clear_tt();
            seen_generation = generation;
        }
        gen_gradient(&shared, &mut searcher, &mut rng, &job);
        shared.queue.finish_job();
    }
}

/// PVの葉局面。途中で再生できなくなったらそこまでで止める。
fn pv_leaf(root: &Position, root_move: Move, pv: &[Move]) -> Position {
    let mut pos = root.clone();
    if pos.do_move(root_move).is_none() {
        return pos;
    }
    for &m in pv {
        if pos.do_move(m).is_none() {
            break;
        }
    }
    pos
}

/// 1ジョブ分の勾配を共有勾配FVへ積む
fn gen_gradient(
    shared: &OnlineShared,
    searcher: &mut Searcher,
    rng: &mut ChaCha8Rng,
    job: &OnlineJob,
) {
    let Some(mut pos) = Position::from_compact(&job.board) else {
        log::warn!("skipping job with broken board");
        return;
    };
    let expert = job.expert;
    let black = pos.side_to_move() == Color::Black;

    let mut moves = MoveGen::legal_moves(&mut pos);
    if moves.len() < 2 {
        return;
    }
    moves.shuffle(rng);

    searcher.clear_history();

    // 教師の手。王手なら1手延長する。
    let depth = shared.depth + i32::from(pos.gives_check(expert));
    let Some(undo) = pos.do_move(expert) else {
        return;
    };
    searcher.set_depth(depth);
    let out = searcher.search_full(&mut pos);
    pos.undo_move(expert, undo);
    let val0 = -out.value;
    let pv0 = out.pv;

    if val0.is_mate_score() {
        return;
    }

    let alpha = val0 - hinge_margin(&pos);
    let beta = val0 + MAX_HINGE_MARGIN;

    searcher.set_depth(shared.depth);
    let mut count = 0usize;
    let mut gsum = 0.0f32;
    for &m in &moves {
        if m == expert {
            continue;
        }
        if count >= NUMBER_OF_SIBLING_NODES {
            break;
        }
        let Some(undo) = pos.do_move(m) else {
            continue;
        };
        let out = searcher.search(&mut pos, -beta, -alpha);
        pos.undo_move(m, undo);
        count += 1;
        let v = -out.value;

        // 不一致度の計測
        shared.error_count.fetch_add(1, Ordering::Relaxed);
        let clamped = v.raw().clamp(alpha.raw(), beta.raw());
        {
            let mut sum = shared.error_sum.lock().unwrap();
            *sum += ((clamped - alpha.raw()) as f32 * gradient_scale()) as f64;
        }

        if v <= alpha || v >= beta {
            continue;
        }

        let leaf = pv_leaf(&pos, m, &out.pv);
        let g = gradient_scale() * if black { 1.0 } else { -1.0 };
        {
            let mut grad = shared.grad.lock().unwrap();
            grad.extract(&leaf, -g);
        }
        gsum += g;
    }

    {
        let mut grad = shared.grad.lock().unwrap();
        let leaf0 = pv_leaf(&pos, expert, &pv0);
        grad.extract(&leaf0, gsum);
        shared
            .mini_batch_scale
            .fetch_add(NUMBER_OF_SIBLING_NODES as u32, Ordering::Relaxed);
    }
}

pub struct OnlineLearning {
    config: LearnConfig,
    eval: Arc<Evaluator>,
    shared: Arc<OnlineShared>,
    w: Fv<f32>,
    u: Fv<f32>,
    jobs: Vec<OnlineJob>,
    mini_batch_count: u32,
    rng: ChaCha8Rng,
    workers: Vec<JoinHandle<()>>,
    timer: Instant,
    json: Option<StructuredLogger>,
}

impl OnlineLearning {
    pub fn new(config: LearnConfig, eval: Arc<Evaluator>) -> Result<OnlineLearning> {
        let json = match &config.log_json {
            Some(path) => Some(StructuredLogger::new(path).context("cannot open json log")?),
            None => None,
        };
        let shared = Arc::new(OnlineShared {
            eval: Arc::clone(&eval),
            queue: JobQueue::new(),
            grad: Mutex::new(Fv::new()),
            mini_batch_scale: AtomicU32::new(0),
            error_count: AtomicU32::new(0),
            error_sum: Mutex::new(0.0),
            tt_generation: AtomicU32::new(0),
            depth: config.depth,
        });
        Ok(OnlineLearning {
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            w: Fv::new(),
            u: Fv::new(),
            jobs: Vec::new(),
            mini_batch_count: 1,
            workers: Vec::new(),
            timer: Instant::now(),
            json,
            config,
            eval,
            shared,
        })
    }

    /// ジョブを追加する
    pub fn push_job(&mut self, job: OnlineJob) {
        self.jobs.push(job);
    }

    /// 残りジョブ数
    pub fn remaining_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// これまでに完了したミニバッチ数 + 1
    pub fn mini_batch_count(&self) -> u32 {
        self.mini_batch_count
    }

    #[doc(hidden)]
    pub fn raw_fvs_mut(&mut self) -> (&mut Fv<f32>, &mut Fv<f32>) {
        (&mut self.w, &mut self.u)
    }

    /// ワーカースレッドを起動する
    pub fn start_workers(&mut self) -> Result<()> {
        debug_assert!(self.workers.is_empty());
        let nt = self.config.threads.max(1);
        for wn in 0..nt {
            let shared = Arc::clone(&self.shared);
            let seed = self.config.seed.wrapping_add(0x9e37_79b9 * (wn as u64 + 1));
            let handle = std::thread::Builder::new()
                .name(format!("learn-worker-{wn}"))
                .spawn(move || worker_main(shared, seed))
                .context("cannot spawn worker thread")?;
            self.workers.push(handle);
        }
        Ok(())
    }

    /// ワーカースレッドを停止して合流する
    pub fn stop_workers(&mut self) {
        self.shared.queue.request_shutdown();
        for h in self.workers.drain(..) {
            h.join().expect("worker thread panicked");
        }
    }

    /// 1ミニバッチ分の学習を行う。ジョブが足りなければ `false`。
    pub fn mini_batch(&mut self) -> Result<bool> {
        if self.jobs.len() < MINI_BATCH_LENGTH {
            return Ok(false);
        }

        log::info!("jobs={}", self.jobs.len());

        self.shared.mini_batch_scale.store(0, Ordering::Relaxed);
        self.shared.error_count.store(0, Ordering::Relaxed);
        *self.shared.error_sum.lock().unwrap() = 0.0;

        let drained = self.jobs.split_off(self.jobs.len() - MINI_BATCH_LENGTH);
        self.shared.queue.push_all(drained);

        self.shared.queue.wait_for_workers();

        let scale = self.shared.mini_batch_scale.load(Ordering::Relaxed).max(1) as f32;
        let count = self.mini_batch_count as f32;

        let mut max_w = 0.0f32;
        let mut magnitude_w = 0.0f64;
        let mut max_u = 0.0f32;
        {
            // 勾配に従って生の重みと累積を動かす
            let mut grad = self.shared.grad.lock().unwrap();
            let update1 = |g: &mut f32, w: &mut f32, u: &mut f32,
                           max_w: &mut f32,
                           magnitude_w: &mut f64,
                           max_u: &mut f32| {
                let f = *g / scale + norm_pull(*w);
                *g = 0.0;
                *w += f;
                *u += f * count;
                *max_w = max_w.max(w.abs());
                *magnitude_w += w.abs() as f64;
                *max_u = max_u.max(u.abs());
            };
            for ((g, w), u) in grad
                .kpp
                .iter_mut()
                .zip(self.w.kpp.iter_mut())
                .zip(self.u.kpp.iter_mut())
            {
                update1(g, w, u, &mut max_w, &mut magnitude_w, &mut max_u);
            }
            for ((g, w), u) in grad
                .kkp
                .iter_mut()
                .zip(self.w.kkp.iter_mut())
                .zip(self.u.kkp.iter_mut())
            {
                update1(g, w, u, &mut max_w, &mut magnitude_w, &mut max_u);
            }
        }

        self.mini_batch_count += 1;
        let count = self.mini_batch_count as f32;

        // 平均化した重みを公開して保存する
        let mut max = 0i32;
        let mut magnitude = 0i64;
        let mut non_zero = 0i64;
        {
            let mut weights = self.eval.weights_mut();
            let average = |w: f32, u: f32, e: &mut i16,
                           max: &mut i32,
                           magnitude: &mut i64,
                           non_zero: &mut i64| {
                let v = (w - u / count).round();
                *e = v.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
                let abs = (*e as i32).abs();
                *max = (*max).max(abs);
                *magnitude += abs as i64;
                *non_zero += i64::from(*e != 0);
            };
            for ((&w, &u), e) in self
                .w
                .kpp
                .iter()
                .zip(self.u.kpp.iter())
                .zip(weights.kpp.iter_mut())
            {
                average(w, u, e, &mut max, &mut magnitude, &mut non_zero);
            }
            for ((&w, &u), e) in self
                .w
                .kkp
                .iter()
                .zip(self.u.kkp.iter())
                .zip(weights.kkp.iter_mut())
            {
                average(w, u, e, &mut max, &mut magnitude, &mut non_zero);
            }
        }
        self.eval
            .write_file(&self.config.eval_file)
            .inspect_err(|e| log::error!("{e:#}"))?;

        // 以降の探索は最新の重みで行う
        {
            let mut weights = self.eval.weights_mut();
            for (&w, e) in self.w.kpp.iter().zip(weights.kpp.iter_mut()) {
                *e = w.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            }
            for (&w, e) in self.w.kkp.iter().zip(weights.kkp.iter_mut()) {
                *e = w.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            }
        }

        let error_count = self.shared.error_count.load(Ordering::Relaxed).max(1);
        let error = *self.shared.error_sum.lock().unwrap() / error_count as f64;
        let elapsed = self.timer.elapsed().as_secs_f32();
        log::info!(
            "mini_batch_count={}\terror={error:.4}\tmax={max}\tmagnitude={magnitude}\tnon_zero={non_zero}\tmax_w={max_w:.3}\tmagnitude_w={magnitude_w:.1}\tmax_u={max_u:.3}\telapsed: {elapsed:.1}",
            self.mini_batch_count - 1
        );
        if let Some(json) = &self.json {
            json.write_json(&serde_json::json!({
                "mini_batch_count": self.mini_batch_count - 1,
                "error": error,
                "max": max,
                "magnitude": magnitude,
                "non_zero": non_zero,
                "max_w": max_w,
                "magnitude_w": magnitude_w,
                "max_u": max_u,
                "elapsed": elapsed,
            }));
        }

        // キャッシュと置換表を捨てて次のミニバッチへ
        self.eval.clear_cache();
        self.shared.tt_generation.fetch_add(1, Ordering::Relaxed);

        Ok(true)
    }

    /// 学習を実行する
    pub fn run(&mut self) -> Result<()> {
        log::info!("begin learning");
        self.timer = Instant::now();

        let files = enumerate_kifu(&self.config.kifu_dir).inspect_err(|e| {
            log::error!("{e:#}");
        })?;
        if files.is_empty() {
            log::error!("no kifu files in {}", self.config.kifu_dir.display());
            bail!("no kifu files");
        }

        for (i, path) in files.iter().enumerate() {
            log::info!("loading ({}/{}): [{}]", i + 1, files.len(), path.display());
            let record = match GameRecord::read_file(path) {
                Ok(r) => r,
                Err(e) => {
                    log::warn!("skipping game: {e:#}");
                    continue;
                }
            };
            for (pos, expert) in record.positions() {
                self.jobs.push(OnlineJob {
                    board: pos.to_compact(),
                    expert,
                });
            }
        }

        self.jobs.shuffle(&mut self.rng);

        self.start_workers()?;
        let result = (|| -> Result<()> {
            while self.mini_batch()? {}
            Ok(())
        })();
        self.stop_workers();
        result?;

        log::info!("completed..");
        log::info!("elapsed: {:.1}", self.timer.elapsed().as_secs_f32());
        log::info!("end learning");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hinge_margin_bounds_and_monotonicity() {
        let pos = Position::initial();
        assert_eq!(hinge_margin(&pos), MIN_HINGE_MARGIN);

        // 持ち駒が増えるほどマージンは広がり、上限で頭打ちになる
        let mut mid = Position::initial();
        mid.set_hand(Color::Black, PieceType::Pawn, 5);
        mid.rebuild_hash();
        let m_mid = hinge_margin(&mid);
        assert!(m_mid > MIN_HINGE_MARGIN);
        assert!(m_mid < MAX_HINGE_MARGIN);

        let mut late = Position::initial();
        late.set_hand(Color::Black, PieceType::Pawn, 18);
        late.set_hand(Color::White, PieceType::Pawn, 18);
        late.set_hand(Color::Black, PieceType::Rook, 2);
        late.rebuild_hash();
        assert_eq!(hinge_margin(&late), MAX_HINGE_MARGIN);
    }

    #[test]
    fn test_progression_range() {
        assert_eq!(progression(&Position::initial()), 0.0);
        let mut pos = Position::initial();
        pos.set_hand(Color::Black, PieceType::Gold, 4);
        pos.rebuild_hash();
        let p = progression(&pos);
        assert!(p > 0.0 && p <= 1.0);
    }
}
