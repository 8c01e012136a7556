use super::*;

#[test]
fn test_register_into_custom_registry() {
    let registry = Registry::new();
    let metrics = CoordMetrics::register(&registry).unwrap();

    metrics.watch_restarts.with_label_values(&["my/prefix/"]).inc();
    metrics.tasks_finished.with_label_values(&["some.task", "succeeded"]).inc();

    let names: Vec<_> = registry.gather().iter().map(|m| m.get_name().to_string()).collect();
    assert!(names.contains(&"dcoord_watch_restarts_total".to_string()), "{names:?}");
    assert!(names.contains(&"dcoord_tasks_finished_total".to_string()), "{names:?}");
}

#[test]
fn test_registering_twice_fails() {
    let registry = Registry::new();
    CoordMetrics::register(&registry).unwrap();
    assert!(CoordMetrics::register(&registry).is_err());
}

#[test]
fn test_instances_do_not_share_counters() {
    let a = CoordMetrics::new().unwrap();
    let b = CoordMetrics::new().unwrap();

    a.tasks_ignored.with_label_values(&["t"]).inc();
    a.tasks_ignored.with_label_values(&["t"]).inc();

    assert_eq!(a.tasks_ignored.with_label_values(&["t"]).get(), 2);
    assert_eq!(b.tasks_ignored.with_label_values(&["t"]).get(), 0);
}

#[test]
fn test_gather_text_contains_samples() {
    let metrics = CoordMetrics::new().unwrap();
    metrics.mirror_keys.with_label_values(&["p/"]).set(3);
    let text = metrics.gather_text();
    assert!(text.contains("dcoord_mirror_keys{prefix=\"p/\"} 3"), "{text}");
}
