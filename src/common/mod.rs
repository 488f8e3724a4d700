use std::time::Duration;

/// Render an elapsed time for log lines: `1.234s`, `42ms`, `7µs`, `80ns`
pub fn format_cost(d: Duration) -> String {
    if d >= Duration::from_secs(1) {
        let secs = d.as_secs_f64();
        return if secs < 10.0 {
            format!("{secs:.3}s")
        } else if secs < 100.0 {
            format!("{secs:.2}s")
        } else {
            format!("{secs:.0}s")
        };
    }

    let ms = d.as_millis();
    if ms > 0 {
        return format!("{ms}ms");
    }
    let us = d.as_micros();
    if us > 0 {
        return format!("{us}µs");
    }
    format!("{}ns", d.as_nanos())
}
