//! Plans executed by the run engine against the mock instrument.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing_test::traced_test;
use tst_core::capabilities::{CaptureCount, Movable, Stageable};
use tst_core::document::{Document, EventDoc, StopDoc};
use tst_experiment::plans::{
    EnergyCalibration, MantaDarkFlat, SimCount, SimPrint, SimRelScan, TomoDemo, XasDemo,
};
use tst_experiment::{ExitStatus, PlanOutcome, RunEngine};
use tst_hardware::drivers::mock::Noise;
use tst_hardware::{create_mock_registry, DeviceRegistry, InstrumentConfig, ProposalPathProvider};

async fn mock_engine() -> RunEngine {
    let registry = create_mock_registry(Arc::new(ProposalPathProvider::mock("tst")))
        .await
        .unwrap();
    RunEngine::new(Arc::new(registry))
}

async fn run(engine: &RunEngine, plan: Box<dyn tst_experiment::Plan>) -> (PlanOutcome, Vec<Document>) {
    let mut rx = engine.subscribe();
    engine.queue(plan).await;
    let outcome = engine.start().await.unwrap();
    (outcome, drain(&mut rx))
}

fn drain(rx: &mut broadcast::Receiver<Document>) -> Vec<Document> {
    let mut docs = Vec::new();
    while let Ok(doc) = rx.try_recv() {
        docs.push(doc);
    }
    docs
}

fn events<'a>(docs: &'a [Document], stream: &str) -> Vec<&'a EventDoc> {
    let descriptor = docs.iter().find_map(|d| match d {
        Document::Descriptor(desc) if desc.name == stream => Some(desc.uid.clone()),
        _ => None,
    });
    docs.iter()
        .filter_map(|d| match d {
            Document::Event(e) if Some(&e.descriptor_uid) == descriptor.as_ref() => Some(e),
            _ => None,
        })
        .collect()
}

fn stop(docs: &[Document]) -> &StopDoc {
    docs.iter()
        .rev()
        .find_map(|d| match d {
            Document::Stop(s) => Some(s),
            _ => None,
        })
        .unwrap()
}

#[tokio::test]
async fn tomography_captures_every_projection() {
    let engine = mock_engine().await;
    let (outcome, docs) = run(&engine, Box::new(TomoDemo::default())).await;
    assert_eq!(outcome.status, ExitStatus::Success);
    assert_eq!(outcome.run_uids.len(), 1);

    assert_eq!(docs.first().unwrap().kind(), "start");
    assert_eq!(stop(&docs).exit_status, "success");

    let resources: Vec<&str> = docs
        .iter()
        .filter_map(|d| match d {
            Document::StreamResource(r) => Some(r.data_key.as_str()),
            _ => None,
        })
        .collect();
    assert!(resources.contains(&"manta1"));
    assert!(resources.contains(&"panda1"));

    let last = *events(&docs, "tomo_stream").last().unwrap();
    assert_eq!(last.data["manta1"], serde_json::json!(21));
    assert_eq!(last.data["panda1"], serde_json::json!(21));

    let registry = engine.registry();
    let velocity = registry.get_movable("rot_motor").unwrap().velocity().await.unwrap();
    assert_eq!(velocity, 90.0);
    assert!(!registry.get_stageable("manta1").unwrap().is_staged().await.unwrap());
}

#[tokio::test]
async fn tomography_rejects_bad_geometry_before_touching_hardware() {
    let engine = mock_engine().await;
    let plan = TomoDemo {
        num_images: 8,
        ..TomoDemo::default()
    };
    let (outcome, docs) = run(&engine, Box::new(plan)).await;
    assert!(matches!(outcome.status, ExitStatus::Fail(ref m) if m.contains("not an integer")));
    assert!(docs.is_empty());
    assert!(outcome.run_uids.is_empty());
}

#[tokio::test]
async fn dark_flat_streams() {
    let engine = mock_engine().await;
    let plan = MantaDarkFlat {
        num_dark: 3,
        num_flat: 2,
        ..MantaDarkFlat::default()
    };
    let (outcome, docs) = run(&engine, Box::new(plan)).await;
    assert!(outcome.status.is_success());
    assert_eq!(events(&docs, "dark").len(), 3);
    assert_eq!(events(&docs, "flat").len(), 2);
    let stop = stop(&docs);
    assert_eq!(stop.num_events["dark"], 3);
    assert_eq!(stop.num_events["flat"], 2);
}

#[tokio::test]
async fn xas_with_detector() {
    let engine = mock_engine().await;
    let (outcome, docs) = run(&engine, Box::new(XasDemo::new(50, 1.0, 0.0, 10.0))).await;
    assert_eq!(outcome.status, ExitStatus::Success, "{:?}", outcome.status);

    let panda = *events(&docs, "panda1_stream").last().unwrap();
    assert_eq!(panda.data["panda1"], serde_json::json!(50));
    let manta = *events(&docs, "manta1_stream").last().unwrap();
    assert_eq!(manta.data["manta1"], serde_json::json!(50));

    let registry = engine.registry();
    let capture = registry.get_capture_count("manta1").unwrap();
    assert_eq!(capture.num_capture().await.unwrap(), 50);
    let position = registry.get_movable("rot_motor").unwrap().position().await.unwrap();
    assert_eq!(position, 15.0);
}

#[tokio::test]
async fn xas_panda_only() {
    let engine = mock_engine().await;
    let plan = XasDemo::new(10, 1.0, 20.0, 10.0).with_detector(None);
    let (outcome, docs) = run(&engine, Box::new(plan)).await;
    assert!(outcome.status.is_success(), "{:?}", outcome.status);
    assert!(events(&docs, "manta1_stream").is_empty());
    assert_eq!(events(&docs, "panda1_stream").len(), 1);
}

const FAILING_PANDA: &str = r#"
mock_mode = true

[[devices]]
id = "manta1"
driver = "mock_manta"

[[devices]]
id = "panda1"
driver = "mock_panda"
[devices.config]
fail_operations = ["complete"]

[[devices]]
id = "rot_motor"
driver = "mock_motor"
"#;

#[tokio::test]
#[traced_test]
#[serial_test::serial]
async fn xas_aborts_flyers_when_acquisition_fails() {
    let config = InstrumentConfig::from_toml_str(FAILING_PANDA).unwrap();
    let registry = DeviceRegistry::from_config(&config).await.unwrap();
    let engine = RunEngine::new(Arc::new(registry));

    let (outcome, docs) = run(&engine, Box::new(XasDemo::new(10, 1.0, 0.0, 10.0))).await;
    assert!(matches!(outcome.status, ExitStatus::Fail(ref m) if m.contains("complete_panda")));
    assert_eq!(stop(&docs).exit_status, "fail");
    assert!(logs_contain("aborting flyers"));

    let registry = engine.registry();
    for id in ["manta1", "panda1"] {
        let staged = registry.get_stageable(id).unwrap().is_staged().await.unwrap();
        assert!(!staged, "{id} left staged");
    }
}

#[tokio::test]
async fn energy_calibration_visits_every_point() {
    let engine = mock_engine().await;
    let plan = EnergyCalibration::new(vec![1.0, 2.5, 4.0]);
    let (outcome, docs) = run(&engine, Box::new(plan)).await;
    assert!(outcome.status.is_success());

    let readings: Vec<f64> = events(&docs, "calibration")
        .iter()
        .map(|e| e.data["rot_motor"].as_f64().unwrap())
        .collect();
    assert_eq!(readings, vec![1.0, 2.5, 4.0]);
}

#[tokio::test]
async fn sim_count_reads_the_peak() {
    let engine = mock_engine().await;
    let plan = SimCount {
        imax: 500.0,
        ..SimCount::new(3)
    };
    let (outcome, docs) = run(&engine, Box::new(plan)).await;
    assert!(outcome.status.is_success());

    let primary = events(&docs, "primary");
    assert_eq!(primary.len(), 3);
    for event in primary {
        assert!((event.data["sim_det"].as_f64().unwrap() - 500.0).abs() < 1e-9);
    }
}

#[tokio::test]
async fn sim_rel_scan_returns_motor() {
    let engine = mock_engine().await;
    let registry = engine.registry().clone();
    registry.get_movable("sim_motor").unwrap().move_abs(1.0).await.unwrap();

    let plan = SimRelScan {
        num: 5,
        noise: Noise::None,
        center: 1.0,
        ..SimRelScan::default()
    };
    let (outcome, docs) = run(&engine, Box::new(plan)).await;
    assert!(outcome.status.is_success());

    let primary = events(&docs, "primary");
    assert_eq!(primary.len(), 5);
    let positions: Vec<f64> = primary
        .iter()
        .map(|e| e.data["sim_motor"].as_f64().unwrap())
        .collect();
    assert_eq!(positions, vec![-1.5, -0.25, 1.0, 2.25, 3.5]);
    let peak = primary[2].data["sim_det"].as_f64().unwrap();
    assert!((peak - 10_000.0).abs() < 1e-9);

    let position = registry.get_movable("sim_motor").unwrap().position().await.unwrap();
    assert_eq!(position, 1.0);
}

#[tokio::test]
#[traced_test]
async fn sim_print_opens_no_run() {
    let engine = mock_engine().await;
    let plan = SimPrint {
        message: "hello beamline".to_string(),
    };
    let (outcome, docs) = run(&engine, Box::new(plan)).await;
    assert!(outcome.status.is_success());
    assert!(outcome.run_uids.is_empty());
    assert!(docs.is_empty());
    assert!(logs_contain("hello beamline"));
}

#[tokio::test]
async fn queued_plans_run_in_order() {
    let engine = mock_engine().await;
    let mut rx = engine.subscribe();
    let first = engine.queue(Box::new(SimCount::new(1))).await;
    let second = engine.queue(Box::new(SimCount::new(2))).await;

    let outcomes = engine.run_queue().await.unwrap();
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].run_uids, vec![first]);
    assert_eq!(outcomes[1].run_uids, vec![second]);
    assert_eq!(engine.queue_len().await, 0);

    let stops = drain(&mut rx)
        .into_iter()
        .filter(|d| d.kind() == "stop")
        .count();
    assert_eq!(stops, 2);
}
