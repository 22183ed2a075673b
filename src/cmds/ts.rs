// This file is part of Lookback, a continuous screen activity recorder.
// Copyright (C) 2025 The Lookback Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use base::time::Time;
use base::Error;
use bpaf::Bpaf;

/// Translates between integer and human-readable timestamps.
#[derive(Bpaf, Debug)]
#[bpaf(command("ts"))]
pub struct Args {
    /// Timestamp(s) to translate: either milliseconds since the Unix epoch
    /// or an RFC 3339 string, e.g. `1735689600000`, `2025-01-01T00:00:00Z`.
    #[bpaf(positional("TS"), some("must specify at least one timestamp"))]
    timestamps: Vec<String>,
}

pub fn run(args: Args) -> Result<i32, Error> {
    for timestamp in &args.timestamps {
        let t = Time::parse(timestamp)?;
        println!("{} == {}", t, t.0);
    }
    Ok(0)
}
