//! CSA棋譜の読み込み
//!
//! `PI`（平手初期配置）と指し手行（`+7776FU` / `-0055KA` 形式)を解釈し、
//! 合法性を検査しながら `GameRecord` に変換する。`N`/`V`/`T`/`%` などの
//! ヘッダ行やコメントは読み飛ばす。

use std::path::Path;

use anyhow::{bail, ensure, Context, Result};

use crate::position::Position;
use crate::types::{Color, File, Move, PieceType, Rank, Square};

/// 1ゲーム分の棋譜
#[derive(Clone)]
pub struct GameRecord {
    pub initial: Position,
    pub moves: Vec<Move>,
}

impl GameRecord {
    /// ファイルから読み込む
    pub fn read_file(path: &Path) -> Result<GameRecord> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read csa file: {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("broken csa file: {}", path.display()))
    }

    /// CSAテキストを解析する
    pub fn parse(text: &str) -> Result<GameRecord> {
        let mut pos = Position::initial();
        let initial = pos.clone();
        let mut moves = Vec::new();

        for line in text.lines() {
            let s = line.trim();
            if s.is_empty()
                || s.starts_with('\'')
                || s.starts_with('%')
                || s.starts_with('N')
                || s.starts_with('V')
                || s.starts_with('T')
                || s.starts_with('$')
                || s == "PI"
            {
                continue;
            }
            if s.starts_with('+') || s.starts_with('-') {
                if s.len() < 7 {
                    // "+" 単独の開始手番指定行など
                    continue;
                }
                let m = parse_csa_move(&pos, &s[..7])?;
                ensure!(pos.do_move(m).is_some(), "illegal move in record: {s}");
                moves.push(m);
                continue;
            }
            // P1..P9 等の明示配置は扱わない（平手のみ）
            if s.starts_with('P') {
                bail!("unsupported board setup line: {s}");
            }
        }

        Ok(GameRecord { initial, moves })
    }

    /// (局面, その局面で指された手) の列を訪ねる
    pub fn positions(&self) -> impl Iterator<Item = (Position, Move)> + '_ {
        let mut pos = self.initial.clone();
        self.moves.iter().map(move |&m| {
            let here = pos.clone();
            let _ = pos.do_move(m);
            (here, m)
        })
    }
}

fn piece_type_from_csa(code: &str) -> Result<(PieceType, bool)> {
    use PieceType::*;
    let (pt, promoted) = match code {
        "FU" => (Pawn, false),
        "KY" => (Lance, false),
        "KE" => (Knight, false),
        "GI" => (Silver, false),
        "KI" => (Gold, false),
        "KA" => (Bishop, false),
        "HI" => (Rook, false),
        "OU" => (King, false),
        "TO" => (ProPawn, true),
        "NY" => (ProLance, true),
        "NK" => (ProKnight, true),
        "NG" => (ProSilver, true),
        "UM" => (Horse, true),
        "RY" => (Dragon, true),
        _ => bail!("unknown CSA piece code: {code}"),
    };
    Ok((pt, promoted))
}

fn square_from_csa(file_digit: u8, rank_digit: u8) -> Result<Square> {
    ensure!(
        (1..=9).contains(&file_digit) && (1..=9).contains(&rank_digit),
        "bad square: {file_digit}{rank_digit}"
    );
    let file = File::from_index(file_digit as usize - 1).unwrap();
    let rank = Rank::from_index(rank_digit as usize - 1).unwrap();
    Ok(Square::new(file, rank))
}

/// "+7776FU" 形式の1手を `Move` に変換する
fn parse_csa_move(pos: &Position, mv: &str) -> Result<Move> {
    let bytes = mv.as_bytes();
    let side = match bytes[0] {
        b'+' => Color::Black,
        b'-' => Color::White,
        _ => bail!("bad side prefix: {mv}"),
    };
    ensure!(
        pos.side_to_move() == side,
        "turn mismatch: {mv} but side to move is {:?}",
        pos.side_to_move()
    );
    let fx = bytes[1] - b'0';
    let fy = bytes[2] - b'0';
    let tx = bytes[3] - b'0';
    let ty = bytes[4] - b'0';
    let (pt, promoted_code) = piece_type_from_csa(&mv[5..7])?;
    let to = square_from_csa(tx, ty)?;

    if fx == 0 && fy == 0 {
        ensure!(!promoted_code && pt != PieceType::King, "cannot drop: {mv}");
        return Ok(Move::new_drop(pt, to));
    }

    let from = square_from_csa(fx, fy)?;
    let moving = pos.piece_on(from);
    ensure!(moving.is_some(), "no piece at source: {mv}");
    ensure!(moving.color() == side, "source piece belongs to opponent: {mv}");
    // CSAの駒コードは移動後の駒を表す。移動前が生駒で移動後が成駒なら成り。
    let promote = promoted_code && !moving.piece_type().is_promoted();
    Ok(Move::new_move(from, to, promote))
}
