//! End-to-end tests of the localization engine
//!
//! These tests drive the public API the way an application does: build a map, bind a filter to it, and run
//! move/sense/normalize/resample cycles, either by hand or through the closed-loop simulation. They check the
//! population invariants (size, bounds, weight normalization, relevance range) over many cycles, convergence on
//! hand-built scenarios with an unambiguous reading, and the file round trips of maps, configurations and
//! results.
use std::env;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

use assert_approx_eq::assert_approx_eq;

use mcl::config::{FilterConfig, MapConfig, SimulationConfig};
use mcl::sim::{LocalizationResult, build_map, run_simulation};
use mcl::{GridMap, MapQuery, ParticleFilter, RobotConfig, UpdateMode};

fn temp_path(name: &str) -> PathBuf {
    env::temp_dir().join(format!("mcl_it_{}_{}", std::process::id(), name))
}

/// 200 x 200 room with a border and a pillar in the lower right quarter
fn room_with_pillar() -> Rc<GridMap> {
    let mut map = GridMap::new(200, 200, 1.0, 0.0).unwrap().with_border();
    map.fill_rect(130, 130, 160, 160);
    Rc::new(map)
}

fn precise_robot() -> RobotConfig {
    RobotConfig {
        sensor_noise_mm: 5.0,
        displacement_noise_percent: 0.0,
        rotation_noise_deg: 0.0,
        ..Default::default()
    }
}

fn filter_config(num_particles: usize, randomness: f64, mode: UpdateMode) -> FilterConfig {
    FilterConfig {
        num_particles,
        randomness,
        mode,
        seed: Some(11),
        ..Default::default()
    }
}

#[test]
fn population_invariants_hold_over_many_cycles() {
    let map = room_with_pillar();
    for mode in [UpdateMode::Simple, UpdateMode::Markov] {
        let mut pf = ParticleFilter::new(
            Rc::clone(&map),
            RobotConfig::default(),
            &filter_config(150, 0.1, mode),
        )
        .unwrap();
        let mut heading = 0.0;
        for cycle in 0..60 {
            if cycle % 10 == 9 {
                heading += std::f64::consts::FRAC_PI_2;
            }
            pf.set_heading(heading);
            pf.move_particles(15.0);
            for p in pf.particles() {
                assert!(p.x >= 0.0 && p.x <= 199.0, "x out of bounds: {}", p.x);
                assert!(p.y >= 0.0 && p.y <= 199.0, "y out of bounds: {}", p.y);
            }
            pf.sense(Some(80.0), heading);
            pf.normalize();
            let sum: f64 = pf.particles().iter().map(|p| p.weight).sum();
            if sum != 0.0 {
                assert_approx_eq!(sum, 1.0, 1e-9);
            }
            pf.resample();
            assert_eq!(pf.particles().len(), 150);
            assert!((0.0..=1.0).contains(&pf.relevance()));
            let ess = pf.effective_sample_size();
            assert!(ess >= 0.0 && ess <= 150.0 + 1e-6);
        }
    }
}

#[test]
fn filter_settles_on_the_only_consistent_position() {
    let map = room_with_pillar();
    let mut pf =
        ParticleFilter::new(Rc::clone(&map), precise_robot(), &filter_config(40, 0.0, UpdateMode::Simple))
            .unwrap();
    // Half of the population 150 mm below the top wall, half 50 mm below it
    for (i, p) in pf.particles_mut().iter_mut().enumerate() {
        p.x = 100.0;
        p.y = if i % 2 == 0 { 150.0 } else { 50.0 };
        p.heading = 0.0;
    }
    // The top border row is at y = 0
    pf.sense(Some(150.0), 0.0);
    pf.normalize();
    pf.resample();
    assert_eq!(pf.particles().len(), 40);
    assert!(pf.particles().iter().all(|p| p.y == 150.0));
    let barycenter = pf.barycenter().unwrap();
    assert_approx_eq!(barycenter.x, 100.0, 1e-9);
    assert_approx_eq!(barycenter.y, 150.0, 1e-9);
    assert_approx_eq!(pf.relevance(), 1.0, 1e-12);
    assert!(pf.is_localized());

    // Tracking keeps the collapsed population together
    pf.set_heading(0.0);
    pf.move_particles(20.0);
    pf.sense(Some(130.0), 0.0);
    pf.normalize();
    pf.resample();
    assert!(pf.particles().iter().all(|p| p.x == 100.0 && p.y == 130.0));
    assert!(pf.is_localized());
}

#[test]
fn full_randomness_spreads_the_population_again() {
    let map = room_with_pillar();
    let mut pf =
        ParticleFilter::new(Rc::clone(&map), precise_robot(), &filter_config(500, 1.0, UpdateMode::Simple))
            .unwrap();
    for p in pf.particles_mut() {
        p.x = 100.0;
        p.y = 100.0;
    }
    assert_approx_eq!(pf.check_relevance(), 1.0, 1e-12);
    pf.resample();
    assert_eq!(pf.particles().len(), 500);
    for p in pf.particles() {
        assert!(!map.is_obstacle(p.x as usize, p.y as usize));
    }
    // Nothing survives the wheel, so the previous score is kept
    assert_approx_eq!(pf.relevance(), 1.0, 1e-12);
    assert!(pf.check_relevance() < 0.75);
}

#[test]
fn rejected_population_is_left_unnormalized() {
    let map = room_with_pillar();
    let mut pf =
        ParticleFilter::new(Rc::clone(&map), precise_robot(), &filter_config(30, 0.0, UpdateMode::Markov))
            .unwrap();
    for p in pf.particles_mut() {
        p.weight = 0.0;
    }
    pf.sense(Some(50.0), 0.0);
    pf.normalize();
    assert!(pf.particles().iter().all(|p| p.weight == 0.0));
    assert_eq!(pf.effective_sample_size(), 0.0);
    // The wheel still terminates and keeps the population size
    pf.resample();
    assert_eq!(pf.particles().len(), 30);
}

#[test]
fn swapping_maps_repopulates_on_the_new_one() {
    let mut pf = ParticleFilter::new(
        room_with_pillar(),
        RobotConfig::default(),
        &filter_config(80, 0.0, UpdateMode::Simple),
    )
    .unwrap();
    let small = Rc::new(GridMap::from_text("#####\n#...#\n#####\n", 1.0, 0.0).unwrap());
    pf.set_map(Rc::clone(&small)).unwrap();
    assert_eq!(pf.particles().len(), 80);
    for p in pf.particles() {
        assert_eq!(p.y, 1.0);
        assert!((1.0..=3.0).contains(&p.x));
        assert_approx_eq!(p.weight, 1.0 / 80.0, 1e-15);
    }

    let full = Rc::new(GridMap::from_text("###\n###\n", 1.0, 0.0).unwrap());
    assert!(pf.set_map(full).is_err());
    assert_eq!(pf.map().width(), 5);
}

#[test]
fn simulation_is_reproducible_with_fixed_seeds() {
    let config = SimulationConfig {
        steps: 40,
        seed: 5,
        start: Some((60.0, 60.0, 0.0)),
        filter: filter_config(200, 0.05, UpdateMode::Simple),
        ..Default::default()
    };
    let first = run_simulation(&config, room_with_pillar()).unwrap();
    let second = run_simulation(&config, room_with_pillar()).unwrap();
    assert_eq!(first.records, second.records);
    assert_eq!(first.records.len(), 40);
    for record in &first.records {
        assert!(!room_with_pillar().is_obstacle(record.true_x as usize, record.true_y as usize));
        assert!(record.error_mm.is_finite());
    }
}

#[test]
fn simulation_results_round_trip_through_csv() {
    let config = SimulationConfig {
        steps: 15,
        filter: filter_config(50, 0.2, UpdateMode::Markov),
        ..Default::default()
    };
    let result = run_simulation(&config, room_with_pillar()).unwrap();
    let path = temp_path("results.csv");
    result.to_csv(&path).unwrap();
    let loaded = LocalizationResult::from_csv(&path).unwrap();
    assert_eq!(loaded.records.len(), 15);
    for (a, b) in loaded.records.iter().zip(&result.records) {
        assert_eq!(a.step, b.step);
        assert_eq!(a.localized, b.localized);
        assert_eq!(a.reading_mm.is_some(), b.reading_mm.is_some());
        assert_approx_eq!(a.error_mm, b.error_mm, 1e-9);
        assert_approx_eq!(a.relevance, b.relevance, 1e-12);
    }
    fs::remove_file(&path).ok();
    assert!(LocalizationResult::from_csv(temp_path("missing.csv")).is_err());
}

#[test]
fn simulation_runs_from_map_and_config_files() {
    let map_path = temp_path("office.map");
    let mut text = String::from("; office floor\n");
    text.push_str(&"#".repeat(60));
    text.push('\n');
    for row in 1..39 {
        let mut line = String::from("#");
        for col in 1..59 {
            line.push(if row > 15 && row < 25 && col > 20 && col < 30 { '#' } else { '.' });
        }
        line.push_str("#\n");
        text.push_str(&line);
    }
    text.push_str(&"#".repeat(60));
    text.push('\n');
    fs::write(&map_path, text).unwrap();

    let config = SimulationConfig {
        steps: 20,
        step_distance_mm: 5.0,
        danger_distance_mm: 10.0,
        map: MapConfig {
            path: Some(map_path.clone()),
            pixels_per_mm: 0.5,
            ..Default::default()
        },
        filter: filter_config(100, 0.1, UpdateMode::Simple),
        ..Default::default()
    };
    let config_path = temp_path("simulation.yaml");
    config.to_file(&config_path).unwrap();
    let loaded = SimulationConfig::from_file(&config_path).unwrap();
    assert_eq!(loaded, config);

    let map = build_map(&loaded.map).unwrap();
    assert_eq!((map.width(), map.height()), (60, 40));
    assert_eq!(map.free_cell_count(), 58 * 38 - 9 * 9);
    let result = run_simulation(&loaded, Rc::new(map)).unwrap();
    assert_eq!(result.records.len(), 20);
    assert!((0.0..=1.0).contains(&result.localized_fraction()));

    fs::remove_file(&map_path).ok();
    fs::remove_file(&config_path).ok();
}

#[test]
fn simulation_fails_on_a_map_without_free_cells() {
    let mut blocked = GridMap::new(4, 4, 1.0, 0.0).unwrap();
    blocked.fill_rect(0, 0, 3, 3);
    let result = run_simulation(&SimulationConfig::default(), Rc::new(blocked));
    assert!(result.is_err());
}
