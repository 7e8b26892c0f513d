//! Terminal rendering of core notices.

use skiff_core::progress::{format_eta, format_size, format_speed};
use skiff_core::{Direction, Notice};

pub fn render(notice: &Notice) -> String {
    match notice {
        Notice::Progress(p) => {
            let verb = match p.direction {
                Direction::Sending => "Sending",
                Direction::Receiving => "Receiving",
            };
            format!(
                "{verb} [{}/{}] {} {:.1}% {} ETA {}",
                p.index,
                p.total,
                p.file_name,
                p.percent,
                format_speed(p.speed),
                format_eta(p.eta)
            )
        }
        Notice::FileSaved { name, size } => format!("Saved {name} ({})", format_size(*size)),
        Notice::BatchComplete => "Transfer complete".to_string(),
        Notice::Cancelled => "Transfer cancelled".to_string(),
        Notice::Reconnecting => "Connection interrupted, waiting to reconnect...".to_string(),
        Notice::Reconnected => "Reconnected".to_string(),
        Notice::ConnectionLost => "Connection lost. Please try again.".to_string(),
        Notice::NetworkMismatch { local, peer } => format!(
            "Devices are on different networks ({local} vs {peer}). Connect both to the same network and retry."
        ),
        Notice::PeerLeft => "Peer ended the session".to_string(),
        Notice::Error(msg) => format!("Error: {msg}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_core::Progress;

    #[test]
    fn progress_line() {
        let line = render(&Notice::Progress(Progress {
            direction: Direction::Receiving,
            file_name: "movie.mp4".into(),
            index: 2,
            total: 3,
            percent: 42.34,
            speed: Some(1.5 * 1024.0 * 1024.0),
            eta: Some(75.0),
        }));
        assert_eq!(line, "Receiving [2/3] movie.mp4 42.3% 1.5 MB/s ETA 1m 15s");
    }

    #[test]
    fn unknown_rate_uses_placeholder() {
        let line = render(&Notice::Progress(Progress {
            direction: Direction::Sending,
            file_name: "a".into(),
            index: 1,
            total: 1,
            percent: 0.0,
            speed: None,
            eta: None,
        }));
        assert!(line.ends_with("-- ETA --"));
    }

    #[test]
    fn mismatch_names_both_addresses() {
        let line = render(&Notice::NetworkMismatch {
            local: "192.168.1.5".parse().unwrap(),
            peer: "192.168.2.5".parse().unwrap(),
        });
        assert!(line.contains("192.168.1.5 vs 192.168.2.5"));
    }
}
