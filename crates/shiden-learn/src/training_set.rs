//! 訓練データの入出力
//!
//! ファイルはグループの連なりで、各グループは
//! `CompactBoard`、1本以上の手順（`長さu8` + `指し手u16[長さ-1]`、
//! little-endian）、終端の `0x00` からなる。先頭の手順が教師PVで、
//! その先頭の指し手がルートでの教師の手。
//!
//! 書き込みはグループ単位で排他し（呼び出し側がミューテックスで包む）、
//! 読み込みは単一スレッドの逐次処理なのでロックしない。EOFの判定は
//! `CompactBoard` ヘッダの読み込みでのみ行い、そこでの短い読みは正常な
//! 終端として扱う。グループ途中のEOFはデータ破損。

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};

use shiden_core::position::{CompactBoard, COMPACT_BOARD_LEN};
use shiden_core::types::Move;

/// 1グループ（ルート局面と手順の列、指し手は16bitワイヤ表現のまま）
pub struct TrainingGroup {
    pub board: CompactBoard,
    pub lines: Vec<Vec<u16>>,
}

pub struct TrainingWriter {
    w: BufWriter<File>,
}

impl TrainingWriter {
    pub fn create(path: &Path) -> Result<TrainingWriter> {
        let f = File::create(path)
            .with_context(|| format!("cannot create training file: {}", path.display()))?;
        Ok(TrainingWriter {
            w: BufWriter::with_capacity(1 << 16, f),
        })
    }

    /// 1グループを書き出す
    ///
    /// 各手順の先頭はルートでの指し手、残りはその後のPV。
    pub fn write_group(&mut self, board: &CompactBoard, lines: &[Vec<Move>]) -> Result<()> {
        debug_assert!(!lines.is_empty());
        self.w.write_all(board.as_bytes())?;
        for line in lines {
            debug_assert!(line.len() < u8::MAX as usize);
            let length = line.len() as u8 + 1;
            self.w.write_all(&[length])?;
            for m in line {
                self.w.write_all(&m.to_u16().to_le_bytes())?;
            }
        }
        self.w.write_all(&[0u8])?;
        Ok(())
    }

    /// バッファを書き切ってファイルを閉じる
    pub fn close(mut self) -> Result<()> {
        self.w.flush().context("cannot flush training file")?;
        Ok(())
    }
}

pub struct TrainingReader {
    r: BufReader<File>,
}

impl TrainingReader {
    pub fn open(path: &Path) -> Result<TrainingReader> {
        let f = File::open(path)
            .with_context(|| format!("cannot open training file: {}", path.display()))?;
        Ok(TrainingReader {
            r: BufReader::with_capacity(1 << 16, f),
        })
    }

    /// 次のグループを読む。正常な終端では `None`。
    pub fn next_group(&mut self) -> Result<Option<TrainingGroup>> {
        let mut header = [0u8; COMPACT_BOARD_LEN];
        match read_exact_or_eof(&mut self.r, &mut header)? {
            ReadState::Eof => return Ok(None),
            ReadState::Full => {}
        }

        let mut lines = Vec::new();
        loop {
            let mut len_buf = [0u8; 1];
            self.r
                .read_exact(&mut len_buf)
                .context("training data ends inside a group")?;
            let length = len_buf[0];
            if length == 0 {
                break;
            }
            let mut line = Vec::with_capacity(length as usize - 1);
            for _ in 0..length - 1 {
                let mut mv = [0u8; 2];
                self.r
                    .read_exact(&mut mv)
                    .context("training data ends inside a line")?;
                line.push(u16::from_le_bytes(mv));
            }
            lines.push(line);
        }
        if lines.is_empty() {
            bail!("training data group has no lines");
        }

        Ok(Some(TrainingGroup {
            board: CompactBoard(header),
            lines,
        }))
    }
}

enum ReadState {
    Full,
    Eof,
}

/// ヘッダ位置でのEOF（短い読みを含む）だけを正常終了として区別する
fn read_exact_or_eof(r: &mut impl Read, buf: &mut [u8]) -> Result<ReadState> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => return Ok(ReadState::Eof),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("cannot read training data header"),
        }
    }
    Ok(ReadState::Full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shiden_core::position::Position;
    use shiden_core::types::{File as BFile, PieceType, Rank, Square};

    fn sample_moves() -> Vec<Move> {
        vec![
            Move::new_move(
                Square::new(BFile::File7, Rank::Rank7),
                Square::new(BFile::File7, Rank::Rank6),
                false,
            ),
            Move::new_move(
                Square::new(BFile::File3, Rank::Rank3),
                Square::new(BFile::File3, Rank::Rank4),
                false,
            ),
            Move::new_drop(PieceType::Pawn, Square::SQ_55),
        ]
    }

    #[test]
    fn test_roundtrip_single_group() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("training.dat");

        let pos = Position::initial();
        let cb = pos.to_compact();
        let moves = sample_moves();
        let lines = vec![moves.clone(), vec![moves[1], moves[2]]];

        let mut w = TrainingWriter::create(&path).unwrap();
        w.write_group(&cb, &lines).unwrap();
        w.close().unwrap();

        let mut r = TrainingReader::open(&path).unwrap();
        let group = r.next_group().unwrap().expect("one group");
        assert_eq!(group.board.as_bytes(), cb.as_bytes());
        assert_eq!(group.lines.len(), 2);
        assert_eq!(
            group.lines[0],
            moves.iter().map(|m| m.to_u16()).collect::<Vec<_>>()
        );
        assert!(r.next_group().unwrap().is_none());
    }

    #[test]
    fn test_length_one_line_counts_as_recorded() {
        // length=1（指し手0個）の手順も1本として数える
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("training.dat");

        let cb = Position::initial().to_compact();
        let mut w = TrainingWriter::create(&path).unwrap();
        w.write_group(&cb, &[vec![]]).unwrap();
        w.close().unwrap();

        let mut r = TrainingReader::open(&path).unwrap();
        let group = r.next_group().unwrap().unwrap();
        assert_eq!(group.lines.len(), 1);
        assert!(group.lines[0].is_empty());
    }

    #[test]
    fn test_eof_mid_group_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("training.dat");

        let cb = Position::initial().to_compact();
        let mut bytes = cb.as_bytes().to_vec();
        bytes.push(3); // 2手の手順を予告して切れているデータ
        bytes.extend_from_slice(&0x1234u16.to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();

        let mut r = TrainingReader::open(&path).unwrap();
        assert!(r.next_group().is_err());
    }

    #[test]
    fn test_short_header_is_clean_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("training.dat");
        // ヘッダ途中で切れたファイルは正常終了として扱う
        std::fs::write(&path, [0u8; 10]).unwrap();
        let mut r = TrainingReader::open(&path).unwrap();
        assert!(r.next_group().unwrap().is_none());
    }

    #[test]
    fn test_multiple_groups_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("training.dat");
        let cb = Position::initial().to_compact();
        let moves = sample_moves();

        let mut w = TrainingWriter::create(&path).unwrap();
        for k in 1..=3 {
            let lines: Vec<Vec<Move>> = (0..k).map(|_| moves.clone()).collect();
            w.write_group(&cb, &lines).unwrap();
        }
        w.close().unwrap();

        let mut r = TrainingReader::open(&path).unwrap();
        for k in 1..=3 {
            let group = r.next_group().unwrap().unwrap();
            assert_eq!(group.lines.len(), k);
        }
        assert!(r.next_group().unwrap().is_none());
    }
}
