//! Bimstream demo - walks a viewport across a synthetic building.
//!
//! Usage: cargo run --release -- [OPTIONS]
//!
//! Options:
//!   --config <PATH>       Load streaming configuration from JSON
//!   --save-config <PATH>  Write the effective configuration and exit
//!   --role <ROLE>         construction_worker | superintendent | architect | full_featured
//!   --steps <N>           Number of viewport updates (default: 8)
//!   --floors <N>          Floors in the synthetic building (default: 3)

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use bimstream::core::logging;
use bimstream::core::types::DVec3;
use bimstream::object::{InMemorySpatialIndex, Metadata, SpatialObject};
use bimstream::streaming::{StreamingConfig, StreamingEngine, UserRole, ViewportBounds};

const FLOOR_HEIGHT: f64 = 3.5;
const BAY: f64 = 6.0;
const BAYS: usize = 8;

#[tokio::main]
async fn main() {
    logging::init();

    let args: Vec<String> = std::env::args().collect();
    let steps = parse_usize_arg(&args, "--steps").unwrap_or(8);
    let floors = parse_usize_arg(&args, "--floors").unwrap_or(3);

    let config = match parse_str_arg(&args, "--config") {
        Some(path) => match StreamingConfig::load(&PathBuf::from(&path)) {
            Ok(config) => config,
            Err(e) => {
                log::error!("Failed to load {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => StreamingConfig::default(),
    };

    if let Some(path) = parse_str_arg(&args, "--save-config") {
        if let Err(e) = config.save(&PathBuf::from(&path)) {
            log::error!("Failed to save {}: {}", path, e);
            std::process::exit(1);
        }
        println!("Wrote {}", path);
        return;
    }

    let role = match parse_str_arg(&args, "--role").map(|r| r.parse::<UserRole>()) {
        Some(Ok(role)) => role,
        Some(Err(e)) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
        None => config.default_role,
    };

    let objects = synthetic_building(floors);
    println!("=== Bimstream Demo ===");
    println!("Objects: {} on {} floors", objects.len(), floors);
    println!("Role:    {} ({:?} byte budget)", role, role.budget());
    println!("Policy:  {}", config.cache.policy);
    println!();

    let index = Arc::new(InMemorySpatialIndex::from_objects(objects));
    let engine = match StreamingEngine::new(config, index) {
        Ok(engine) => engine,
        Err(e) => {
            log::error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let span = BAY * BAYS as f64;
    for step in 0..steps {
        // Pan along the building while zooming out
        let t = step as f64 / steps.max(1) as f64;
        let extent = 8.0 + t * span * 2.0;
        let center = DVec3::new(4.0 + t * span * 0.5, span * 0.25, FLOOR_HEIGHT * 0.5);
        let viewport = ViewportBounds::new(center, DVec3::new(extent, extent * 0.6, FLOOR_HEIGHT * 2.0), 12 - step as i32);

        let start = Instant::now();
        let bundle = engine.set_viewport(viewport, role).await;
        println!(
            "step {:>2}: lod {} ({:<16}) {:>4} objects, {:>3} deltas, {:>3} templates, {:>6} bytes{} {:.1}ms",
            step,
            bundle.lod.index(),
            bundle.lod.name(),
            bundle.object_count(),
            bundle.compressed_count,
            bundle.templates.len(),
            bundle.total_bytes,
            if bundle.from_cache { " (cached)" } else { "" },
            start.elapsed().as_secs_f64() * 1000.0,
        );
    }

    // Drill into a few objects
    let drill = engine.stream_objects(&["F0-column-0-0", "F0-sprinkler-1-1", "missing"]).await;
    for response in &drill {
        println!(
            "drill {}: accessible={} cached={}",
            response.object_id, response.accessible, response.from_cache
        );
    }

    let report = engine.optimize_bundle();
    println!();
    println!("Optimization: {:?}", report.actions);

    match serde_json::to_string_pretty(&serde_json::json!({
        "cache": engine.cache_status(),
        "engine": engine.stats(),
    })) {
        Ok(json) => println!("{}", json),
        Err(e) => log::error!("Failed to render status: {}", e),
    }
}

/// Grid of columns, walls, outlets, ducts and sprinklers per floor
fn synthetic_building(floors: usize) -> Vec<SpatialObject> {
    let mut objects = Vec::new();
    let outlet_meta = Metadata {
        manufacturer: Some("Leviton".into()),
        model_number: Some("5320-W".into()),
        ..Default::default()
    };
    let sprinkler_meta = Metadata {
        manufacturer: Some("Viking".into()),
        model_number: Some("VK302".into()),
        ..Default::default()
    };

    for floor in 0..floors {
        let z = floor as f64 * FLOOR_HEIGHT;
        for i in 0..BAYS {
            for j in 0..BAYS / 2 {
                let (x, y) = (i as f64 * BAY, j as f64 * BAY);
                objects.push(
                    SpatialObject::new(format!("F{floor}-column-{i}-{j}"), "column", "structural", 1)
                        .with_position(x, y, z + FLOOR_HEIGHT * 0.5)
                        .with_dimensions(0.4, 0.4, FLOOR_HEIGHT)
                        .with_shape("cylinder"),
                );
                objects.push(
                    SpatialObject::new(format!("F{floor}-sprinkler-{i}-{j}"), "sprinkler_head", "fire_protection", 1)
                        .with_position(x + BAY * 0.5, y + BAY * 0.5, z + FLOOR_HEIGHT - 0.1)
                        .with_dimensions(0.05, 0.05, 0.08)
                        .with_metadata(sprinkler_meta.clone()),
                );
                objects.push(
                    SpatialObject::new(format!("F{floor}-outlet-{i}-{j}"), "electrical_outlet", "electrical", 3)
                        .with_position(x + 1.0, y + 0.1, z + 0.3)
                        .with_dimensions(0.1, 0.05, 0.1)
                        .with_metadata(outlet_meta.clone()),
                );
                objects.push(
                    SpatialObject::new(format!("F{floor}-duct-{i}-{j}"), "duct_segment", "hvac", 2)
                        .with_position(x + BAY * 0.5, y, z + FLOOR_HEIGHT - 0.4)
                        .with_dimensions(BAY, 0.5, 0.3),
                );
                objects.push(
                    SpatialObject::new(format!("F{floor}-trim-{i}-{j}"), "trim", "architectural", 5)
                        .with_position(x, y + 0.05, z + 0.05)
                        .with_dimensions(BAY, 0.02, 0.1)
                        .with_extension("finish", serde_json::json!("paint")),
                );
            }
            objects.push(
                SpatialObject::new(format!("F{floor}-wall-{i}"), "wall", "architectural", 2)
                    .with_position(i as f64 * BAY + BAY * 0.5, 0.0, z + FLOOR_HEIGHT * 0.5)
                    .with_dimensions(BAY, 0.2, FLOOR_HEIGHT),
            );
        }
    }
    objects
}

fn parse_str_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn parse_usize_arg(args: &[String], flag: &str) -> Option<usize> {
    parse_str_arg(args, flag).and_then(|v| v.parse().ok())
}
