//! バッチ学習（Bonanza方式）
//!
//! 反復ごとに全棋譜からPV訓練例を並列生成して訓練データに書き出し、
//! その上で勾配計算と重み更新を複数回まわす。損失はシグモイド、
//! 重みはL1の引き戻し付きの乱択丸めで整数のまま動かす。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use shiden_core::eval::{material_slot, Evaluator, Fv, MATERIAL_COUNT};
use shiden_core::movegen::MoveGen;
use shiden_core::position::Position;
use shiden_core::record::GameRecord;
use shiden_core::search::{SearchConfig, Searcher};
use shiden_core::types::{Color, Move, PieceType, Square};

use crate::config::LearnConfig;
use crate::corpus::enumerate_kifu;
use crate::logging::StructuredLogger;
use crate::pool::{JobQueue, POLL_INTERVAL};
use crate::training_set::{TrainingReader, TrainingWriter};

/// 兄弟手を採用する探索窓
pub const SEARCH_WINDOW: i32 = 256;
/// L1正則化の強さ
const NORM: f32 = 1.0e-2;
/// 駒割更新の固定スケジュール（勾配の昇順に割り当てる）
pub const MATERIAL_SCHEDULE: [i32; MATERIAL_COUNT] = [-2, -2, -1, -1, -1, 0, 0, 0, 1, 1, 1, 2, 2];

#[inline]
fn gain() -> f32 {
    7.0 / SEARCH_WINDOW as f32
}

/// 損失関数
#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x * gain()).exp())
}

/// 損失関数の微分
#[inline]
pub fn dsigmoid(x: f32) -> f32 {
    let s = sigmoid(x);
    (s - s * s) * gain()
}

/// L1の引き戻し項
#[inline]
fn norm_pull(e: i16) -> f32 {
    if e > 0 {
        -NORM
    } else if e < 0 {
        NORM
    } else {
        0.0
    }
}

/// 乱択丸めの1セル分の更新。更新後の絶対値を返す。
#[inline]
fn update_cell(g: f32, e: &mut i16, rng: &mut ChaCha8Rng) -> i32 {
    let g = g + norm_pull(*e);
    if g > 0.0 {
        let step: i16 = rng.random_range(0..2) + rng.random_range(0..2);
        *e = e.saturating_add(step);
    } else if g < 0.0 {
        let step: i16 = rng.random_range(0..2) + rng.random_range(0..2);
        *e = e.saturating_sub(step);
    }
    (*e as i32).abs()
}

/// 駒割勾配から13スロット分の更新量を決める
///
/// 勾配の昇順に固定スケジュールを割り当てる。同値が並んだ時の偏りを
/// 避けるため、前半6・後半7スロットをそれぞれ混ぜてから安定ソートする。
pub fn material_update_deltas(
    grads: &[f64; MATERIAL_COUNT],
    rng: &mut ChaCha8Rng,
) -> [i32; MATERIAL_COUNT] {
    let mut order: Vec<usize> = (0..MATERIAL_COUNT).collect();
    order[..6].shuffle(rng);
    order[6..].shuffle(rng);
    order.sort_by(|&a, &b| grads[a].partial_cmp(&grads[b]).unwrap_or(std::cmp::Ordering::Equal));

    let mut deltas = [0i32; MATERIAL_COUNT];
    for (rank, &slot) in order.iter().enumerate() {
        deltas[slot] = MATERIAL_SCHEDULE[rank];
    }
    deltas
}

/// 局面の駒種ごとの枚数差（先手 - 後手、盤と持ち駒の合計）
pub fn material_counts(pos: &Position) -> [i32; MATERIAL_COUNT] {
    let mut counts = [0i32; MATERIAL_COUNT];
    for sq in Square::all() {
        let pc = pos.piece_on(sq);
        if pc.is_none() {
            continue;
        }
        if let Some(slot) = material_slot(pc.piece_type()) {
            counts[slot] += if pc.color() == Color::Black { 1 } else { -1 };
        }
    }
    for pt in PieceType::HAND_PIECES {
        let slot = material_slot(pt).unwrap();
        counts[slot] += pos.hand_count(Color::Black, pt) as i32;
        counts[slot] -= pos.hand_count(Color::White, pt) as i32;
    }
    counts
}

/// 訓練データの1手順をルートから再生して葉局面を返す
///
/// 復号できない・指せない手が混ざっていれば `None`（その手順は捨てる）。
pub fn replay_line(root: &Position, line: &[u16]) -> Option<Position> {
    let mut pos = root.clone();
    for &raw in line {
        let m = Move::from_u16_checked(raw)?;
        pos.do_move(m)?;
    }
    Some(pos)
}

struct Shared {
    eval: Arc<Evaluator>,
    queue: JobQueue<PathBuf>,
    writer: Mutex<Option<TrainingWriter>>,
    progress: Mutex<Option<ProgressBar>>,
    total_moves: AtomicU64,
    out_of_window: AtomicU64,
    depth: i32,
}

fn worker_main(shared: Arc<Shared>) {
    let config = SearchConfig {
        max_depth: shared.depth,
        learning: true,
        tt_size_pow2: 1 << 10,
    };
    let mut searcher = Searcher::new(Arc::clone(&shared.eval), config);

    while !shared.queue.is_shutdown() {
        std::thread::sleep(POLL_INTERVAL);
        let Some(path) = shared.queue.try_dequeue() else {
            continue;
        };
        if let Err(e) = generate_from_game(&shared, &mut searcher, &path) {
            // 読めない棋譜は飛ばして学習を続ける
            log::error!("skipping game: {e:#}");
        }
        shared.queue.finish_job();

        let progress = shared.progress.lock().unwrap();
        if let Some(pb) = progress.as_ref() {
            pb.inc(1);
        }
    }
}

fn generate_from_game(shared: &Shared, searcher: &mut Searcher, path: &Path) -> Result<()> {
    let record = GameRecord::read_file(path)?;
    for (mut pos, expert) in record.positions() {
        generate_example(shared, searcher, &mut pos, expert)?;
    }
    Ok(())
}

/// 1局面分の訓練例を生成して訓練データに書き出す
fn generate_example(
    shared: &Shared,
    searcher: &mut Searcher,
    pos: &mut Position,
    expert: Move,
) -> Result<()> {
    let moves = MoveGen::legal_moves(pos);
    if moves.len() < 2 {
        return Ok(());
    }

    searcher.clear_history();

    // 教師の手。王手なら1手延長する。
    let depth = shared.depth + i32::from(pos.gives_check(expert));
    let root = pos.to_compact();
    let Some(undo) = pos.do_move(expert) else {
        return Ok(());
    };
    searcher.set_depth(depth);
    let out = searcher.search_full(pos);
    pos.undo_move(expert, undo);
    let val0 = -out.value;

    // 詰みが見えている局面は除外
    if val0.is_mate_score() {
        return Ok(());
    }

    shared.total_moves.fetch_add(1, Ordering::Relaxed);

    let alpha = val0 - SEARCH_WINDOW;
    let beta = val0 + SEARCH_WINDOW;
    let mut lines: Vec<Vec<Move>> = Vec::new();
    let mut expert_line = vec![expert];
    expert_line.extend_from_slice(&out.pv);
    lines.push(expert_line);

    searcher.set_depth(shared.depth);
    for &m in &moves {
        if m == expert {
            continue;
        }
        let Some(undo) = pos.do_move(m) else {
            continue;
        };
        let out = searcher.search(pos, -beta, -alpha);
        pos.undo_move(m, undo);
        let v = -out.value;

        if v <= alpha {
            // 教師の手のほうが明確に良い
            continue;
        }
        if v >= beta {
            shared.out_of_window.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        let mut line = vec![m];
        line.extend_from_slice(&out.pv);
        lines.push(line);
    }

    // 窓に入った兄弟が無ければ書かない
    if lines.len() < 2 {
        return Ok(());
    }

    let mut writer = shared.writer.lock().unwrap();
    let w = writer.as_mut().context("training writer is not open")?;
    w.write_group(&root, &lines)?;
    Ok(())
}

pub struct BatchLearning {
    config: LearnConfig,
    eval: Arc<Evaluator>,
    shared: Arc<Shared>,
    grad: Fv<f32>,
    material_grad: [f64; MATERIAL_COUNT],
    loss: f64,
    max_weight: i32,
    magnitude: u64,
    rng: ChaCha8Rng,
    json: Option<StructuredLogger>,
    workers: Vec<std::thread::JoinHandle<()>>,
}

impl BatchLearning {
    pub fn new(config: LearnConfig, eval: Arc<Evaluator>) -> Result<BatchLearning> {
        let json = match &config.log_json {
            Some(path) => Some(StructuredLogger::new(path).context("cannot open json log")?),
            None => None,
        };
        let shared = Arc::new(Shared {
            eval: Arc::clone(&eval),
            queue: JobQueue::new(),
            writer: Mutex::new(None),
            progress: Mutex::new(None),
            total_moves: AtomicU64::new(0),
            out_of_window: AtomicU64::new(0),
            depth: config.depth,
        });
        Ok(BatchLearning {
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            grad: Fv::new(),
            material_grad: [0.0; MATERIAL_COUNT],
            loss: 0.0,
            max_weight: 0,
            magnitude: 0,
            json,
            config,
            eval,
            shared,
            workers: Vec::new(),
        })
    }

    /// ワーカースレッドを起動する
    pub fn start_workers(&mut self) -> Result<()> {
        debug_assert!(self.workers.is_empty());
        let nt = self.config.threads.max(1);
        for wn in 0..nt {
            let shared = Arc::clone(&self.shared);
            let handle = std::thread::Builder::new()
                .name(format!("learn-worker-{wn}"))
                .spawn(move || worker_main(shared))
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

    /// 全棋譜からPV訓練例を生成して訓練データに書き出す
    ///
    /// ワーカーが起動済みであること。完了時には訓練データは閉じられている。
    pub fn generate_training_data(&mut self) -> Result<()> {
        let files = enumerate_kifu(&self.config.kifu_dir).inspect_err(|e| {
            log::error!("{e:#}");
        })?;
        if files.is_empty() {
            log::error!("no kifu files in {}", self.config.kifu_dir.display());
            bail!("no kifu files");
        }

        let writer = TrainingWriter::create(&self.config.training_file)
            .inspect_err(|e| log::error!("{e:#}"))?;
        *self.shared.writer.lock().unwrap() = Some(writer);
        self.shared.total_moves.store(0, Ordering::Relaxed);
        self.shared.out_of_window.store(0, Ordering::Relaxed);

        let pb = ProgressBar::new(files.len() as u64);
        pb.set_style(
            ProgressStyle::with_template("[{bar:50}] {percent:>3}%")
                .expect("valid template")
                .progress_chars("# "),
        );
        *self.shared.progress.lock().unwrap() = Some(pb);
        self.shared.queue.push_all(files);

        self.shared.queue.wait_for_workers();

        if let Some(pb) = self.shared.progress.lock().unwrap().take() {
            pb.finish();
        }
        let writer = self
            .shared
            .writer
            .lock()
            .unwrap()
            .take()
            .context("training writer disappeared")?;
        writer.close()?;
        Ok(())
    }

    /// 学習を実行する
    pub fn run(&mut self) -> Result<()> {
        log::info!("begin learning");
        let timer = Instant::now();

        self.start_workers()?;
        let result = self.iterate(timer);
        self.stop_workers();
        result?;

        log::info!("completed..");
        log::info!("elapsed: {:.1}", timer.elapsed().as_secs_f32());
        log::info!("end learning");
        Ok(())
    }

    fn iterate(&mut self, timer: Instant) -> Result<()> {
        let mut update_count = 256u32;

        for i in 0..self.config.iteration {
            self.generate_training_data()?;

            update_count = (update_count / 2).max(16);

            for j in 0..update_count {
                self.loss = 0.0;
                self.generate_gradient()?;
                self.update_parameters();

                let total = self.shared.total_moves.load(Ordering::Relaxed).max(1) as f64;
                let oow = self.shared.out_of_window.load(Ordering::Relaxed) as f64;
                let out_wind_loss = oow / total;
                let total_loss = (oow + self.loss) / total;
                let elapsed = timer.elapsed().as_secs_f32();
                log::info!(
                    "elapsed={elapsed:.1}\titeration={i},{j}\tout_wind_loss={out_wind_loss:.4}\tloss={total_loss:.4}\tmax={}\tmagnitude={}",
                    self.max_weight,
                    self.magnitude
                );
                if let Some(json) = &self.json {
                    json.write_json(&serde_json::json!({
                        "elapsed": elapsed,
                        "iteration": i,
                        "update": j,
                        "out_wind_loss": out_wind_loss,
                        "loss": total_loss,
                        "max": self.max_weight,
                        "magnitude": self.magnitude,
                    }));
                }
            }

            self.eval
                .material
                .save(&self.config.material_file)
                .inspect_err(|e| log::error!("{e:#}"))?;
            self.eval
                .write_file(&self.config.eval_file)
                .inspect_err(|e| log::error!("{e:#}"))?;
            self.eval.clear_cache();
        }

        Ok(())
    }

    /// 訓練データを流し読みして勾配を積む
    pub fn generate_gradient(&mut self) -> Result<()> {
        let mut reader = TrainingReader::open(&self.config.training_file)
            .inspect_err(|e| log::error!("{e:#}"))?;
        self.grad.init();
        self.material_grad = [0.0; MATERIAL_COUNT];

        while let Some(group) = reader.next_group()? {
            let Some(root) = Position::from_compact(&group.board) else {
                bail!("broken root position in training data");
            };
            let black = root.side_to_move() == Color::Black;

            let mut lines = group.lines.iter();
            let Some(expert) = lines.next() else {
                continue;
            };
            // 教師PVが再生できないグループは基準値が無いので捨てる
            let Some(leaf0) = replay_line(&root, expert) else {
                continue;
            };
            let v0 = self.eval.evaluate(&leaf0).raw();
            let counts0 = material_counts(&leaf0);

            for line in lines {
                let Some(leaf) = replay_line(&root, line) else {
                    continue;
                };
                let v = self.eval.evaluate(&leaf).raw();
                let mut diff = (v - v0) as f32;
                if !black {
                    diff = -diff;
                }
                self.loss += sigmoid(diff) as f64;

                let mut g = dsigmoid(diff);
                if !black {
                    g = -g;
                }
                self.grad.extract(&leaf0, g);
                self.grad.extract(&leaf, -g);

                let counts = material_counts(&leaf);
                for k in 0..MATERIAL_COUNT {
                    self.material_grad[k] += g as f64 * (counts0[k] - counts[k]) as f64;
                }
            }
        }
        Ok(())
    }

    /// 勾配にもとづいて重みと駒割を更新する
    pub fn update_parameters(&mut self) {
        // 鏡像対の勾配を足し合わせて両側に持たせる
        self.grad.symmetrize(|a, b| a + b);

        self.max_weight = 0;
        self.magnitude = 0;
        let Self {
            grad,
            eval,
            rng,
            max_weight,
            magnitude,
            ..
        } = self;
        {
            let mut w = eval.weights_mut();
            for (&g, e) in grad.kpp.iter().zip(w.kpp.iter_mut()) {
                let abs = update_cell(g, e, rng);
                *max_weight = (*max_weight).max(abs);
                *magnitude += abs as u64;
            }
            for (&g, e) in grad.kkp.iter().zip(w.kkp.iter_mut()) {
                let abs = update_cell(g, e, rng);
                *max_weight = (*max_weight).max(abs);
                *magnitude += abs as u64;
            }
            // 乱択丸めでずれた分を鏡像側からコピーして厳密に対称化する
            w.symmetrize(|_, b| b);
        }
        self.eval.clear_cache();

        let deltas = material_update_deltas(&self.material_grad, &mut self.rng);
        self.eval.material.apply_deltas(&deltas);
    }

    /// 直近の更新での重みの最大絶対値
    pub fn max_weight(&self) -> i32 {
        self.max_weight
    }

    /// 直近の更新での重みの絶対値和
    pub fn magnitude(&self) -> u64 {
        self.magnitude
    }

    /// 直近の勾配パスの損失（窓外損失を除く）
    pub fn loss(&self) -> f64 {
        self.loss
    }

    /// 処理した教師局面の数
    pub fn total_moves(&self) -> u64 {
        self.shared.total_moves.load(Ordering::Relaxed)
    }

    /// 窓の上へ外れた兄弟手の数
    pub fn out_of_window(&self) -> u64 {
        self.shared.out_of_window.load(Ordering::Relaxed)
    }

    #[doc(hidden)]
    pub fn material_grad_mut(&mut self) -> &mut [f64; MATERIAL_COUNT] {
        &mut self.material_grad
    }
}
