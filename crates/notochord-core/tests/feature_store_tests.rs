//! End-to-end tests for the FeatureStore public interface.
//!
//! Each test builds a small corpus of widgets with word features, creates a
//! model over it and drives the reader, writer and partitioner through the
//! facade.

use notochord_core::{
    FeatureRole, FeatureStore, IdQuery, MatrixLayout, ModelRecord, ModelStatus, NotochordError,
    PredictionValues, WidgetFeatureUpload, WidgetRole,
};
use std::collections::BTreeSet;
use tempfile::TempDir;

/// A store with `widgets` widgets, input features `a`/`b`/`c` and output
/// features `pos`/`neg`, plus a model over them.
struct Corpus {
    store: FeatureStore,
    widgets: Vec<i64>,
    inputs: Vec<i64>,
    model: ModelRecord,
}

fn create_corpus(store: FeatureStore, widgets: usize) -> Corpus {
    let widget_store = store.widgets();
    let ds = widget_store.ensure_datasource("rss").unwrap();
    let uuids: Vec<String> = (0..widgets).map(|i| format!("doc-{:02}", i)).collect();
    widget_store.add_widgets(ds, uuids.as_slice()).unwrap();
    let widget_ids: Vec<i64> = widget_store
        .widget_ids(ds, uuids.as_slice())
        .unwrap()
        .into_iter()
        .map(|id| id.expect("widget was just added"))
        .collect();

    let words = widget_store.ensure_feature_set("words", None).unwrap();
    let inputs = store.resolve(words, &["a", "b", "c"]).unwrap();
    let labels = widget_store.ensure_feature_set("labels", None).unwrap();
    let outputs = store.resolve(labels, &["pos", "neg"]).unwrap();

    // Widget i carries a = i and, for even i, c = 1.
    let mut rows = Vec::new();
    for (i, uuid) in uuids.iter().enumerate() {
        rows.push(WidgetFeatureUpload {
            uuid: uuid.clone(),
            datasource: ds,
            feature: inputs[0],
            value: i as f64,
        });
        if i % 2 == 0 {
            rows.push(WidgetFeatureUpload {
                uuid: uuid.clone(),
                datasource: ds,
                feature: inputs[2],
                value: 1.0,
            });
        }
    }
    widget_store.upload_widget_features(&rows).unwrap();

    let model = store
        .models()
        .create(
            b"{\"estimators\": 10}",
            &IdQuery::from_ids(&inputs),
            Some(&IdQuery::from_ids(&outputs)),
        )
        .unwrap();

    Corpus {
        store,
        widgets: widget_ids,
        inputs,
        model,
    }
}

#[test]
fn test_train_predict_cycle_on_disk() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let store = FeatureStore::open(temp.path().join("store.db")).unwrap();
    let corpus = create_corpus(store, 7);
    let model = corpus.model.id();

    let chunks: Vec<_> = corpus
        .store
        .reader()
        .training_data(model, &IdQuery::all_widgets(), Some(3), MatrixLayout::Dense)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();

    let sizes: Vec<usize> = chunks.iter().map(|chunk| chunk.len()).collect();
    assert_eq!(sizes, vec![3, 3, 1]);
    for chunk in &chunks {
        assert_eq!(chunk.matrix.shape(), (chunk.len(), corpus.inputs.len()));
    }

    let streamed: Vec<i64> = chunks
        .iter()
        .flat_map(|chunk| chunk.widget_ids.iter().copied())
        .collect();
    assert_eq!(streamed, corpus.widgets);

    // Column 0 is feature `a`, which holds the widget's position.
    let last = &chunks[2];
    assert_eq!(last.matrix.get(0, 0), 6.0);
    assert_eq!(last.matrix.get(0, 1), 0.0);
    assert_eq!(last.matrix.get(0, 2), 1.0);

    let models = corpus.store.models();
    models.set_trained(model, b"forest").unwrap();
    models.set_metric(model, "accuracy", 0.75).unwrap();
    models.set_metric(model, "accuracy", 0.8).unwrap();
    assert_eq!(models.get(model).unwrap().status(), ModelStatus::Trained);
    assert_eq!(models.get_metric(model, "accuracy").unwrap(), Some(0.8));
    assert!(matches!(
        models.get_metric(model, "recall"),
        Err(NotochordError::NotFound { .. })
    ));
}

#[test]
fn test_prediction_overwrite() {
    let corpus = create_corpus(FeatureStore::open_in_memory().unwrap(), 2);
    let model = corpus.model.id();
    let writer = corpus.store.writer();
    let (w1, w2) = (corpus.widgets[0], corpus.widgets[1]);

    let first = PredictionValues::from(vec![vec![0.1, 0.2], vec![0.3, 0.4]]);
    assert_eq!(writer.write(model, Some(&[w1, w2][..]), &first).unwrap(), 4);
    let second = PredictionValues::from(vec![vec![0.9, 0.9]]);
    writer.write(model, Some(&[w1][..]), &second).unwrap();

    let predictions = writer.read_predictions(model, None).unwrap();
    assert_eq!(
        predictions,
        vec![
            (w1, vec![Some(0.9), Some(0.9)]),
            (w2, vec![Some(0.3), Some(0.4)]),
        ]
    );

    // Predictions land on the model's private features, not on the labels.
    let predicts = corpus
        .store
        .selection()
        .count(model, FeatureRole::Predicts)
        .unwrap();
    assert_eq!(predicts, 2);
}

#[test]
fn test_cross_validation_over_selection() {
    let corpus = create_corpus(FeatureStore::open_in_memory().unwrap(), 10);
    let all: BTreeSet<i64> = corpus.widgets.iter().copied().collect();

    let partitioner = corpus.store.crossval(&IdQuery::all_widgets(), 5).unwrap();
    assert_eq!(partitioner.total(), 10);

    let models = corpus.store.models();
    let reader = corpus.store.reader();
    let selection = corpus.store.selection();
    let mut validated = Vec::new();
    for (train, validation) in partitioner.iter() {
        // One model per fold, as a grid search would do.
        let model = models
            .create(b"{}", &IdQuery::from_ids(&corpus.inputs), None)
            .unwrap()
            .id();

        let train_ids: Vec<i64> = reader
            .training_data(model, &train, Some(4), MatrixLayout::Sparse)
            .unwrap()
            .flat_map(|chunk| chunk.unwrap().widget_ids)
            .collect();
        let (validation_ids, matrix) = reader
            .validation_data(model, &validation, None, MatrixLayout::Sparse)
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .into_parts();

        assert_eq!(train_ids.len(), 8);
        assert_eq!(validation_ids.len(), 2);
        assert_eq!(matrix.shape(), (2, 3));
        assert!(validation_ids.iter().all(|id| !train_ids.contains(id)));
        assert_eq!(selection.count(model, WidgetRole::TrainedOn).unwrap(), 8);
        assert_eq!(selection.count(model, WidgetRole::ValidatedOn).unwrap(), 2);
        validated.extend(validation_ids);
    }

    let unique: BTreeSet<i64> = validated.iter().copied().collect();
    assert_eq!(validated.len(), 10);
    assert_eq!(unique, all);
}

#[test]
fn test_resolve_scenario() {
    let store = FeatureStore::open_in_memory().unwrap();
    let fs1 = store.widgets().ensure_feature_set("fs1", None).unwrap();

    let ids = store.resolve(fs1, &["a", "b", "a", "c"]).unwrap();
    assert_eq!(ids[0], ids[2]);
    let distinct: BTreeSet<i64> = ids.iter().copied().collect();
    assert_eq!(distinct.len(), 3);
    assert!(ids.iter().all(|&id| id > 0));

    assert_eq!(store.resolve(fs1, &["a"]).unwrap(), vec![ids[0]]);
}

#[test]
fn test_supervised_stream_is_rejected() {
    let corpus = create_corpus(FeatureStore::open_in_memory().unwrap(), 1);
    let result = corpus.store.reader().stream(
        corpus.model.id(),
        WidgetRole::TrainedOn,
        Some(10),
        MatrixLayout::Dense,
        true,
    );
    assert!(matches!(result, Err(NotochordError::NotImplemented(_))));
}
