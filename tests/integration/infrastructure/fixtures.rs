use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Writes a JSON5 scenario config defining `scenarios` in the given order.
///
/// Each entry is an id plus extra JSON5 fields spliced into its definition; the
/// port offset follows the entry's position.
pub fn write_config(dir: &Path, scenarios: &[(&str, &str)]) -> Result<PathBuf> {
    let order: Vec<String> = scenarios.iter().map(|(id, _)| format!("\"{}\"", id)).collect();
    let defs: Vec<String> = scenarios
        .iter()
        .enumerate()
        .map(|(offset, (id, extra))| {
            format!(
                "    {id}: {{ name: \"{id} test\", port_offset: {offset}, {extra} }},",
                id = id,
                offset = offset,
                extra = extra
            )
        })
        .collect();

    let contents = format!(
        "// generated by the integration tests\n{{\n  scenario_order: [{}],\n  scenarios: {{\n{}\n  }},\n}}\n",
        order.join(", "),
        defs.join("\n")
    );
    let path = dir.join("scenarios.json5");
    std::fs::write(&path, contents).context("Failed to write scenario config")?;
    Ok(path)
}

/// One SHM record: deltaT then ax, ay, az, temperature as big-endian hex words
pub fn shm_line(delta_us: u32, ax: f32, ay: f32, az: f32, temp: f32) -> String {
    format!(
        "{:08X} {:08X} {:08X} {:08X} {:08X}\n",
        delta_us,
        ax.to_bits(),
        ay.to_bits(),
        az.to_bits(),
        temp.to_bits()
    )
}

/// Writes an SHM file whose name carries `t0_us` and `t0_us + last_delta_us`
pub fn write_shm(dir: &Path, t0_us: u64, last_delta_us: u32, body: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!(
        "shm_0A1B2C3D4E5F_05_{}_{}",
        t0_us,
        t0_us + u64::from(last_delta_us)
    ));
    std::fs::write(&path, body).context("Failed to write SHM file")?;
    Ok(path)
}
