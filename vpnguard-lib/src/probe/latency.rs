//! `latency(host, port, samples)` (spec.md §4.E): mean of `samples`
//! TCP-connect wall-clock times in milliseconds, failures excluded.
//! Grounded on the original's `test_latency`, which does the same
//! connect-and-time loop with `socket.create_connection`.

use std::time::{Duration, Instant};
use tokio::net::TcpStream;

const TIMEOUT: Duration = Duration::from_secs(5);

pub async fn latency(host: &str, port: u16, samples: usize) -> Option<f64> {
    let mut measurements = Vec::with_capacity(samples);

    for _ in 0..samples {
        let start = Instant::now();
        let addr = format!("{host}:{port}");
        match tokio::time::timeout(TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(_stream)) => measurements.push(start.elapsed().as_secs_f64() * 1000.0),
            _ => continue,
        }
    }

    mean(&measurements)
}

fn mean(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        None
    } else {
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_of_empty_samples_is_none() {
        assert_eq!(mean(&[]), None);
    }

    #[test]
    fn mean_excludes_nothing_once_computed() {
        assert_eq!(mean(&[10.0, 20.0, 30.0]), Some(20.0));
    }
}
