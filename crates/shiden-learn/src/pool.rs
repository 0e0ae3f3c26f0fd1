//! ワーカープール
//!
//! 1本のミューテックスで守るジョブキューと進行中カウンタ。ワーカーは
//! 1ms周期のポーリングでジョブを拾い、`wait_for_workers` はキューが
//! 空になり進行中のジョブが無くなるまで待つ。停止はアトミックフラグを
//! ジョブの合間に観測する協調方式で、ジョブの横取りや再割り当てはない。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// ポーリング周期
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

pub struct JobQueue<T> {
    queue: Mutex<VecDeque<T>>,
    active: AtomicI32,
    shutdown: AtomicBool,
}

impl<T> JobQueue<T> {
    pub fn new() -> JobQueue<T> {
        JobQueue {
            queue: Mutex::new(VecDeque::new()),
            active: AtomicI32::new(0),
            shutdown: AtomicBool::new(false),
        }
    }

    /// ジョブをまとめて積む
    pub fn push_all(&self, jobs: impl IntoIterator<Item = T>) {
        let mut q = self.queue.lock().unwrap();
        q.extend(jobs);
    }

    /// ジョブを1つ取り出す。取り出しと同時に進行中カウンタを増やす。
    pub fn try_dequeue(&self) -> Option<T> {
        let mut q = self.queue.lock().unwrap();
        let job = q.pop_front()?;
        self.active.fetch_add(1, Ordering::SeqCst);
        Some(job)
    }

    /// `try_dequeue` で取り出したジョブの完了を申告する
    pub fn finish_job(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// キューが空かつ進行中ジョブなしになるまで待つ
    pub fn wait_for_workers(&self) {
        loop {
            {
                let q = self.queue.lock().unwrap();
                if q.is_empty() && self.active.load(Ordering::SeqCst) == 0 {
                    return;
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

impl<T> Default for JobQueue<T> {
    fn default() -> Self {
        JobQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[test]
    fn test_queue_dequeue_tracks_active() {
        let q = JobQueue::new();
        q.push_all([1, 2, 3]);
        let a = q.try_dequeue().unwrap();
        assert_eq!(a, 1);
        assert_eq!(q.active.load(Ordering::SeqCst), 1);
        q.finish_job();
        assert_eq!(q.active.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_wait_for_workers_and_shutdown() {
        let queue: Arc<JobQueue<u32>> = Arc::new(JobQueue::new());
        let done = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..2 {
            let queue = Arc::clone(&queue);
            let done = Arc::clone(&done);
            handles.push(std::thread::spawn(move || {
                while !queue.is_shutdown() {
                    std::thread::sleep(POLL_INTERVAL);
                    let Some(job) = queue.try_dequeue() else {
                        continue;
                    };
                    done.fetch_add(job, Ordering::SeqCst);
                    queue.finish_job();
                }
            }));
        }

        queue.push_all(1..=100u32);
        queue.wait_for_workers();
        assert_eq!(done.load(Ordering::SeqCst), 5050);

        // 停止要求後は有限時間で join できる
        queue.request_shutdown();
        let start = std::time::Instant::now();
        for h in handles {
            h.join().unwrap();
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
