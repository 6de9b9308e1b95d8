use anyhow::{Context, Result};
use csv::{Reader, Writer};
use rust_decimal::Decimal;
use std::fs::File;
use std::io::{Read, Write};
use trade_engine_core::Tick;

pub struct CsvStorage;

impl CsvStorage {
    /// Writes ticks to a CSV file, oldest first.
    ///
    /// Format: timestamp,instrument,bid,ask
    ///
    /// # Errors
    /// Returns error if file cannot be created or writing fails
    pub fn write_ticks(path: &str, ticks: &[Tick]) -> Result<()> {
        let file =
            File::create(path).with_context(|| format!("Failed to create CSV file: {path}"))?;
        Self::write_ticks_to(file, ticks)
    }

    /// # Errors
    /// Returns error if writing fails
    pub fn write_ticks_to<W: Write>(out: W, ticks: &[Tick]) -> Result<()> {
        let mut writer = Writer::from_writer(out);
        writer.write_record(["timestamp", "instrument", "bid", "ask"])?;

        let mut sorted = ticks.to_vec();
        sorted.sort_by_key(|t| t.timestamp);

        for tick in sorted {
            writer.write_record(&[
                trade_engine_core::tick::iso_z::format(&tick.timestamp),
                tick.instrument.clone(),
                tick.bid.to_string(),
                tick.ask.to_string(),
            ])?;
        }

        writer.flush()?;
        Ok(())
    }

    /// Loads ticks written by [`CsvStorage::write_ticks`] or exported by a broker.
    ///
    /// Rows with crossed or non-positive quotes are rejected with their line number.
    ///
    /// # Errors
    /// Returns error if the file cannot be opened or a row fails to parse
    pub fn read_ticks(path: &str) -> Result<Vec<Tick>> {
        let file = File::open(path).with_context(|| format!("Failed to open CSV file: {path}"))?;
        Self::read_ticks_from(file)
    }

    /// # Errors
    /// Returns error if a row fails to parse
    pub fn read_ticks_from<R: Read>(input: R) -> Result<Vec<Tick>> {
        let mut reader = Reader::from_reader(input);
        let mut ticks = Vec::new();

        for (index, row) in reader.records().enumerate() {
            let line = index + 2;
            let row = row.with_context(|| format!("Malformed CSV row at line {line}"))?;
            let field = |i: usize, name: &str| {
                row.get(i)
                    .map(str::trim)
                    .with_context(|| format!("Missing {name} at line {line}"))
            };

            let timestamp = trade_engine_core::tick::iso_z::parse(field(0, "timestamp")?)
                .with_context(|| format!("Invalid timestamp at line {line}"))?;
            let instrument = field(1, "instrument")?;
            let bid: Decimal = field(2, "bid")?
                .parse()
                .with_context(|| format!("Invalid bid at line {line}"))?;
            let ask: Decimal = field(3, "ask")?
                .parse()
                .with_context(|| format!("Invalid ask at line {line}"))?;

            if instrument.is_empty() || bid <= Decimal::ZERO || ask < bid {
                anyhow::bail!("Invalid quote at line {line}: {instrument} {bid}/{ask}");
            }

            ticks.push(Tick::new(instrument, timestamp, bid, ask));
        }

        ticks.sort_by_key(|t| t.timestamp);
        Ok(ticks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;

    #[test]
    fn reads_back_written_ticks_in_time_order() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let ticks = vec![
            Tick::new("EUR_USD", t0 + Duration::seconds(1), dec!(1.10010), dec!(1.10030)),
            Tick::new("EUR_USD", t0, dec!(1.10000), dec!(1.10020)),
        ];

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ticks.csv");
        let path = path.to_str().unwrap();
        CsvStorage::write_ticks(path, &ticks).unwrap();

        let loaded = CsvStorage::read_ticks(path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].timestamp, t0);
        assert_eq!(loaded[0].mid, dec!(1.10010));
        assert_eq!(loaded[1].bid, dec!(1.10010));
    }

    #[test]
    fn rejects_crossed_quotes() {
        let csv = "timestamp,instrument,bid,ask\n2024-03-01T12:00:00Z,EUR_USD,1.2,1.1\n";
        let err = CsvStorage::read_ticks_from(csv.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }
}
