use classify::{load_class_names, Classify, EvalMetrics, PREDICTIONS_FILE};
use data_contracts::ImageRecord;
use image::{GrayImage, ImageFormat, Luma};
use image_preprocess::{
    BackgroundClass, ImageShape, Mode, Preprocess, PreprocessConfig, RecordWriter,
};
use std::collections::BTreeMap;
use std::io::Cursor;

fn gray_png(side: u32, shade: u8) -> anyhow::Result<Vec<u8>> {
    let img = GrayImage::from_pixel(side, side, Luma([shade]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}

#[test]
fn pipeline_labels_land_in_model_class_space() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let shard = tmp.path().join("validate-00000.tfrecord");
    let mut writer = RecordWriter::create(&shard)?;
    // 1-based labels; slot 0 is reserved for background
    for label in [1i64, 2, 3, 1] {
        let record = ImageRecord::new(gray_png(6, label as u8 * 60)?, label, format!("c{label}"));
        writer.write_record(&record.encode_to_vec())?;
    }
    writer.finish()?;

    let mut cfg = PreprocessConfig::new(ImageShape::new(4, 4, 1), 2);
    cfg.dataset.files.validate = vec![shard.display().to_string()];
    cfg.dataset.background_class = BackgroundClass {
        use_background: false,
        has: true,
    };
    cfg.system.num_readers = 1;
    cfg.system.num_epochs = Some(1);

    let task = Classify::new(cfg.dataset.background_class, 4, Vec::new())?;
    assert_eq!(task.num_classes(), 3);
    let mut pipeline = Preprocess::new(Mode::Validate, false, cfg)?;
    let labels: Vec<i32> = task
        .preprocess(pipeline.batches()?)
        .map(|b| b.map(|b| b.labels))
        .collect::<Result<Vec<_>, _>>()?
        .concat();
    assert_eq!(labels, vec![0, 1, 2, 0]);
    Ok(())
}

#[test]
fn test_writes_named_predictions() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let labels_txt = tmp.path().join("labels.txt");
    std::fs::write(&labels_txt, "cat\ndog\n\n")?;
    let background = BackgroundClass {
        use_background: true,
        has: true,
    };
    let names = load_class_names(&labels_txt, background)?;
    assert_eq!(names, vec!["background", "cat", "dog"]);

    let task = Classify::new(background, 3, names)?;
    let predictions = [
        0.1, 0.2, 0.7, //
        0.8, 0.1, 0.1, //
        0.0, 0.9, 0.1,
    ];
    let out_dir = tmp.path().join("outputs/run");
    let written = task.test(&["a.jpg", "b.jpg", "c.jpg"], &predictions, &out_dir)?;
    assert_eq!(written, out_dir.join(PREDICTIONS_FILE));

    let parsed: BTreeMap<String, String> =
        serde_yaml::from_str(&std::fs::read_to_string(&written)?)?;
    assert_eq!(parsed["a.jpg"], "dog");
    assert_eq!(parsed["b.jpg"], "background");
    assert_eq!(parsed["c.jpg"], "cat");

    assert!(task.test(&["a.jpg"], &predictions, &out_dir).is_err());

    let mut metrics = EvalMetrics::new();
    metrics.update(&predictions, 3, &[2, 1, 1])?;
    assert_eq!(metrics.to_string(), "top1: 66.67%, top5: 100.00%");
    Ok(())
}

fn run_eval(dir: &std::path::Path, use_background: bool, logits: &str) -> anyhow::Result<String> {
    let config = dir.join("eval.toml");
    std::fs::write(
        &config,
        format!(
            "[dataset]\nheight = 8\nwidth = 8\n\
             background_class = {{ use = {use_background}, has = true }}\n\n\
             [system]\nbatch_size = 2\n"
        ),
    )?;
    // pack_shards layout: one line per real class, records labelled 1..=N
    let labels = dir.join("labels.txt");
    std::fs::write(&labels, "cat\ndog\n")?;
    let dump = dir.join("dump.json");
    std::fs::write(
        &dump,
        format!(r#"{{"names": ["a.jpg", "b.jpg"], "labels": [2, 1], "logits": {logits}}}"#),
    )?;
    let out_dir = dir.join(format!("out-{use_background}"));
    let output = std::process::Command::new(env!("CARGO_BIN_EXE_classify_eval"))
        .arg("--config")
        .arg(&config)
        .arg("--predictions")
        .arg(&dump)
        .arg("--labels")
        .arg(&labels)
        .arg("--output-dir")
        .arg(&out_dir)
        .output()?;
    assert!(
        output.status.success(),
        "classify_eval failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8(output.stdout)?;
    assert!(stdout.contains("samples=2 batches=1 top1: 100.00%"), "{stdout}");
    Ok(std::fs::read_to_string(out_dir.join(PREDICTIONS_FILE))?)
}

#[test]
fn eval_binary_counts_background_label_in_dataset() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;

    let with_slot = run_eval(tmp.path(), true, "[[0.0, 0.1, 0.9], [0.1, 0.8, 0.1]]")?;
    let parsed: BTreeMap<String, String> = serde_yaml::from_str(&with_slot)?;
    assert_eq!(parsed["a.jpg"], "dog");
    assert_eq!(parsed["b.jpg"], "cat");

    // background dropped from the model: two outputs, dataset labels shift down by one
    let without_slot = run_eval(tmp.path(), false, "[[0.1, 0.9], [0.8, 0.2]]")?;
    let parsed: BTreeMap<String, String> = serde_yaml::from_str(&without_slot)?;
    assert_eq!(parsed["a.jpg"], "dog");
    assert_eq!(parsed["b.jpg"], "cat");
    Ok(())
}
