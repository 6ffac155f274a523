//! Optional debug log of resolved pseudorange clusters, one JSON object
//! per line. Off by default; enabled by pointing the coordinator at a
//! file path.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use adsb_core::Icao;
use nalgebra::Matrix3;
use serde::Serialize;

use crate::error::Result;
use crate::geodesy::Ecef;

#[derive(Serialize)]
struct ClusterEntry {
    x: f64,
    y: f64,
    z: f64,
    dt_us: f64,
    variance_us2: f64,
}

#[derive(Serialize)]
struct ResolveRecord {
    icao: String,
    time: f64,
    ecef: [f64; 3],
    distinct: u32,
    dof: i32,
    cluster: Vec<ClusterEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ecef_cov: Option<[f64; 9]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    altitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    altitude_error: Option<f64>,
}

pub struct PseudorangeLog {
    path: PathBuf,
    file: File,
}

impl PseudorangeLog {
    pub fn open(path: &Path) -> Result<PseudorangeLog> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(PseudorangeLog {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Reopen the log file, e.g. after a SIGHUP-triggered log rotation.
    pub fn reopen(&mut self) -> Result<()> {
        self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &mut self,
        icao: Icao,
        time: f64,
        ecef: Ecef,
        ecef_cov: Option<Matrix3<f64>>,
        distinct: u32,
        dof: i32,
        cluster: &[(Ecef, f64, f64)],
        altitude: Option<f64>,
        altitude_error: Option<f64>,
    ) -> Result<()> {
        let t0 = cluster.first().map(|&(_, t, _)| t).unwrap_or(0.0);
        let entries = cluster
            .iter()
            .map(|&((x, y, z), t, variance)| ClusterEntry {
                x: x.round(),
                y: y.round(),
                z: z.round(),
                dt_us: ((t - t0) * 1e6 * 10.0).round() / 10.0,
                variance_us2: (variance * 1e12 * 100.0).round() / 100.0,
            })
            .collect();

        let record = ResolveRecord {
            icao: adsb_core::icao_to_string(&icao).to_lowercase(),
            time: (time * 1000.0).round() / 1000.0,
            ecef: [ecef.0.round(), ecef.1.round(), ecef.2.round()],
            distinct,
            dof,
            cluster: entries,
            ecef_cov: ecef_cov.map(|c| {
                [
                    c[(0, 0)].round(),
                    c[(0, 1)].round(),
                    c[(0, 2)].round(),
                    c[(1, 0)].round(),
                    c[(1, 1)].round(),
                    c[(1, 2)].round(),
                    c[(2, 0)].round(),
                    c[(2, 1)].round(),
                    c[(2, 2)].round(),
                ]
            }),
            altitude: altitude.map(|a| a.round()),
            altitude_error: altitude_error.map(|a| a.round()),
        };

        serde_json::to_writer(&self.file, &record)?;
        self.file.write_all(b"\n")?;
        Ok(())
    }
}
