use crate::{
    model_service::{ModelError, ModelService},
    upload_store::UploadStore,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use image::{imageops::FilterType, ImageFormat, RgbImage};
use ndarray::{Array4, ArrayD, Axis};
use std::{io::Cursor, path::Path, sync::Arc};
use thiserror::Error;

pub const IMAGE_WIDTH: u32 = 224;
pub const IMAGE_HEIGHT: u32 = 224;
pub const IMAGE_CHANNELS: usize = 3;

#[derive(Error, Debug)]
pub enum ClassifyError {
    #[error("No file uploaded")]
    MissingUpload,
    #[error("Model not loaded")]
    ModelUnavailable,
    #[error("Processing failed: {0}")]
    Processing(#[from] ProcessingError),
}

#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("Failed to store upload: {0}")]
    Storage(#[from] std::io::Error),
    #[error("Error decoding image: {0}")]
    Decode(image::ImageError),
    #[error("Error encoding image: {0}")]
    Encode(image::ImageError),
    #[error("Failed to build input tensor: {0}")]
    Tensor(String),
    #[error("Inference failed: {0}")]
    Inference(#[from] ModelError),
    #[error("Model returned an empty prediction")]
    EmptyPrediction,
    #[error("Failed to read multipart body: {0}")]
    Multipart(String),
    #[error("Worker task failed: {0}")]
    Worker(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    /// Base64 PNG of the resized image fed to the model.
    pub encoded_image: String,
    pub class_index: usize,
    pub confidence: f32,
    pub label: Option<String>,
}

/// The resized image together with the tensor built from it.
pub struct PreparedImage {
    pub resized: RgbImage,
    pub tensor: Array4<f32>,
}

struct Prediction {
    class_index: usize,
    confidence: f32,
    encoded_image: String,
}

#[derive(Clone)]
pub struct InferenceService {
    model: Option<Arc<dyn ModelService>>,
    labels: Arc<Vec<String>>,
    uploads: UploadStore,
}

impl InferenceService {
    pub fn new(
        model: Option<Arc<dyn ModelService>>,
        labels: Vec<String>,
        uploads: UploadStore,
    ) -> Self {
        Self {
            model,
            labels: Arc::new(labels),
            uploads,
        }
    }

    pub fn is_model_loaded(&self) -> bool {
        self.model.is_some()
    }

    pub async fn classify(
        &self,
        filename: &str,
        bytes: Bytes,
    ) -> Result<Classification, ClassifyError> {
        if filename.trim().is_empty() {
            return Err(ClassifyError::MissingUpload);
        }
        let model = self.model.clone().ok_or(ClassifyError::ModelUnavailable)?;

        let stored = self
            .uploads
            .persist(filename, &bytes)
            .await
            .map_err(ProcessingError::Storage)?;

        // The stored upload is dropped, and its file removed, on the blocking pool.
        let prediction = tokio::task::spawn_blocking(move || {
            let prediction = run_pipeline(model.as_ref(), stored.path());
            drop(stored);
            prediction
        })
        .await
        .map_err(|e| ProcessingError::Worker(e.to_string()))??;

        tracing::debug!(
            "Predicted class {} with score {:.3}",
            prediction.class_index,
            prediction.confidence
        );

        Ok(Classification {
            encoded_image: prediction.encoded_image,
            class_index: prediction.class_index,
            confidence: prediction.confidence,
            label: self.labels.get(prediction.class_index).cloned(),
        })
    }
}

fn run_pipeline(model: &dyn ModelService, path: &Path) -> Result<Prediction, ProcessingError> {
    let bytes = std::fs::read(path)?;
    let prepared = prepare_image(&bytes)?;

    let predictions = model.predict(&prepared.tensor)?;
    let (class_index, confidence) =
        argmax(&predictions).ok_or(ProcessingError::EmptyPrediction)?;

    let encoded_image = encode_png_base64(&prepared.resized)?;

    Ok(Prediction {
        class_index,
        confidence,
        encoded_image,
    })
}

/// Decodes an image of any supported format, converts it to RGB and resizes
/// it to the model resolution with bicubic (Catmull-Rom) sampling.
pub fn prepare_image(bytes: &[u8]) -> Result<PreparedImage, ProcessingError> {
    let original = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .decode()
        .map_err(ProcessingError::Decode)?;

    let resized = image::imageops::resize(
        &original.to_rgb8(),
        IMAGE_WIDTH,
        IMAGE_HEIGHT,
        FilterType::CatmullRom,
    );
    let tensor = to_tensor(&resized)?;

    Ok(PreparedImage { resized, tensor })
}

/// NHWC tensor with a leading batch dimension of one, scaled to `[0, 1]`.
pub fn to_tensor(image: &RgbImage) -> Result<Array4<f32>, ProcessingError> {
    let (width, height) = image.dimensions();
    let values = image
        .as_raw()
        .iter()
        .map(|&v| f32::from(v) / 255.0)
        .collect();

    Array4::from_shape_vec(
        (1, height as usize, width as usize, IMAGE_CHANNELS),
        values,
    )
    .map_err(|e| ProcessingError::Tensor(e.to_string()))
}

/// Index and score of the highest entry in the first batch row. Ties resolve
/// to the lowest index.
pub fn argmax(predictions: &ArrayD<f32>) -> Option<(usize, f32)> {
    let row = match predictions.ndim() {
        0 => return None,
        1 => predictions.view(),
        _ => {
            if predictions.len_of(Axis(0)) == 0 {
                return None;
            }
            predictions.index_axis(Axis(0), 0)
        }
    };

    row.iter()
        .copied()
        .enumerate()
        .reduce(|best, item| if item.1 > best.1 { item } else { best })
}

pub fn encode_png_base64(image: &RgbImage) -> Result<String, ProcessingError> {
    let mut buffer = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
        .map_err(ProcessingError::Encode)?;
    Ok(STANDARD.encode(buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UploadConfig;
    use image::{GrayImage, ImageBuffer, Luma, Rgb, Rgba};
    use ndarray::{arr1, arr2, Array2};
    use std::sync::Mutex;

    struct FixedModel {
        scores: Vec<f32>,
    }

    impl ModelService for FixedModel {
        fn predict(&self, _input: &Array4<f32>) -> Result<ArrayD<f32>, ModelError> {
            let scores = Array2::from_shape_vec((1, self.scores.len()), self.scores.clone())
                .map_err(|e| ModelError::Shape(e.to_string()))?;
            Ok(scores.into_dyn())
        }
    }

    #[derive(Default)]
    struct RecordingModel {
        shapes: Mutex<Vec<Vec<usize>>>,
    }

    impl ModelService for RecordingModel {
        fn predict(&self, input: &Array4<f32>) -> Result<ArrayD<f32>, ModelError> {
            self.shapes.lock().unwrap().push(input.shape().to_vec());
            Ok(arr2(&[[0.0, 0.0, 1.0]]).into_dyn())
        }
    }

    struct FailingModel;

    impl ModelService for FailingModel {
        fn predict(&self, _input: &Array4<f32>) -> Result<ArrayD<f32>, ModelError> {
            Err(ModelError::Shape("unexpected input".to_string()))
        }
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        });
        let mut data = Vec::new();
        img.write_to(&mut Cursor::new(&mut data), ImageFormat::Png)
            .unwrap();
        data
    }

    fn service(model: Option<Arc<dyn ModelService>>, dir: &Path) -> InferenceService {
        let uploads = UploadStore::new(&UploadConfig {
            dir: dir.join("uploads"),
            retain: false,
        });
        InferenceService::new(model, vec!["cat".into(), "dog".into()], uploads)
    }

    #[test]
    fn test_prepare_image_shape_for_any_resolution() {
        for (width, height) in [(1, 1), (100, 100), (640, 480), (300, 1000)] {
            let prepared = prepare_image(&png_bytes(width, height)).unwrap();
            assert_eq!(prepared.tensor.shape(), &[1, 224, 224, 3]);
            assert_eq!(prepared.resized.dimensions(), (IMAGE_WIDTH, IMAGE_HEIGHT));
        }
    }

    #[test]
    fn test_prepare_image_converts_to_rgb() {
        let gray = GrayImage::from_pixel(50, 80, Luma([128]));
        let mut data = Vec::new();
        gray.write_to(&mut Cursor::new(&mut data), ImageFormat::Png)
            .unwrap();
        assert_eq!(prepare_image(&data).unwrap().tensor.shape(), &[1, 224, 224, 3]);

        let rgba = ImageBuffer::from_pixel(30, 30, Rgba([10u8, 20, 30, 40]));
        let mut data = Vec::new();
        rgba.write_to(&mut Cursor::new(&mut data), ImageFormat::Png)
            .unwrap();
        assert_eq!(prepare_image(&data).unwrap().tensor.shape(), &[1, 224, 224, 3]);
    }

    #[test]
    fn test_normalized_values_are_in_unit_range() {
        let prepared = prepare_image(&png_bytes(512, 333)).unwrap();
        assert!(prepared.tensor.iter().all(|&v| (0.0..=1.0).contains(&v)));

        let white = RgbImage::from_pixel(224, 224, Rgb([255, 255, 255]));
        assert!(to_tensor(&white).unwrap().iter().all(|&v| v == 1.0));

        let black = RgbImage::from_pixel(224, 224, Rgb([0, 0, 0]));
        assert!(to_tensor(&black).unwrap().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_tensor_layout_is_nhwc() {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(1, 0, Rgb([255, 0, 51]));

        let tensor = to_tensor(&img).unwrap();
        assert_eq!(tensor.shape(), &[1, 1, 2, 3]);
        assert_eq!(tensor[[0, 0, 1, 0]], 1.0);
        assert_eq!(tensor[[0, 0, 1, 2]], 0.2);
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
    }

    #[test]
    fn test_prepare_image_rejects_garbage() {
        assert!(matches!(
            prepare_image(b"definitely not an image"),
            Err(ProcessingError::Decode(_))
        ));
    }

    #[test]
    fn test_argmax() {
        assert_eq!(argmax(&arr2(&[[0.1, 0.9, 0.0]]).into_dyn()), Some((1, 0.9)));
        assert_eq!(argmax(&arr1(&[0.3, 0.2, 0.5]).into_dyn()), Some((2, 0.5)));
        assert_eq!(argmax(&arr2(&[[0.4, 0.4, 0.2]]).into_dyn()), Some((0, 0.4)));
        assert_eq!(
            argmax(&arr2(&[[0.1, 0.2], [0.9, 0.0]]).into_dyn()),
            Some((1, 0.2))
        );
        assert_eq!(argmax(&ArrayD::<f32>::zeros(vec![1, 0])), None);
        assert_eq!(argmax(&ArrayD::<f32>::zeros(vec![0, 3])), None);
    }

    #[tokio::test]
    async fn test_classify_is_deterministic() {
        let tmp = tempfile::tempdir().unwrap();
        let model: Arc<dyn ModelService> = Arc::new(FixedModel {
            scores: vec![0.1, 0.9, 0.0],
        });
        let service = service(Some(model), tmp.path());
        let image = Bytes::from(png_bytes(64, 48));

        for _ in 0..3 {
            let result = service.classify("cat.png", image.clone()).await.unwrap();
            assert_eq!(result.class_index, 1);
            assert_eq!(result.confidence, 0.9);
            assert_eq!(result.label.as_deref(), Some("dog"));
        }
    }

    #[tokio::test]
    async fn test_model_sees_fixed_shape() {
        let tmp = tempfile::tempdir().unwrap();
        let model = Arc::new(RecordingModel::default());
        let shared: Arc<dyn ModelService> = model.clone();
        let service = service(Some(shared), tmp.path());

        for (width, height) in [(10, 700), (1024, 768)] {
            let result = service
                .classify("photo.png", Bytes::from(png_bytes(width, height)))
                .await
                .unwrap();
            assert_eq!(result.class_index, 2);
            assert_eq!(result.label, None);
        }

        let shapes = model.shapes.lock().unwrap();
        assert_eq!(shapes.len(), 2);
        assert!(shapes.iter().all(|shape| shape == &[1, 224, 224, 3]));
    }

    #[tokio::test]
    async fn test_encoded_image_round_trips_to_resized_pixels() {
        let tmp = tempfile::tempdir().unwrap();
        let model: Arc<dyn ModelService> = Arc::new(FixedModel {
            scores: vec![1.0],
        });
        let service = service(Some(model), tmp.path());
        let data = png_bytes(333, 127);

        let result = service
            .classify("round.png", Bytes::from(data.clone()))
            .await
            .unwrap();

        let png = STANDARD.decode(result.encoded_image).unwrap();
        let decoded = image::load_from_memory_with_format(&png, ImageFormat::Png)
            .unwrap()
            .to_rgb8();
        let expected = prepare_image(&data).unwrap().resized;

        assert_eq!(decoded.dimensions(), (224, 224));
        assert_eq!(decoded.as_raw(), expected.as_raw());
    }

    #[tokio::test]
    async fn test_missing_model_fails_without_writing() {
        let tmp = tempfile::tempdir().unwrap();
        let service = service(None, tmp.path());

        let err = service
            .classify("cat.png", Bytes::from(png_bytes(8, 8)))
            .await
            .unwrap_err();

        assert!(matches!(err, ClassifyError::ModelUnavailable));
        assert!(!service.is_model_loaded());
        assert!(!tmp.path().join("uploads").exists());
    }

    #[tokio::test]
    async fn test_empty_filename_is_missing_upload() {
        let tmp = tempfile::tempdir().unwrap();
        let model: Arc<dyn ModelService> = Arc::new(FixedModel {
            scores: vec![0.1, 0.9],
        });
        let service = service(Some(model), tmp.path());

        for filename in ["", "   "] {
            let err = service
                .classify(filename, Bytes::from(png_bytes(8, 8)))
                .await
                .unwrap_err();
            assert!(matches!(err, ClassifyError::MissingUpload));
        }
        assert!(!tmp.path().join("uploads").exists());
    }

    #[tokio::test]
    async fn test_failures_are_processing_errors_and_clean_up() {
        let tmp = tempfile::tempdir().unwrap();
        let model: Arc<dyn ModelService> = Arc::new(FailingModel);
        let service = service(Some(model), tmp.path());

        let err = service
            .classify("cat.png", Bytes::from(png_bytes(8, 8)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClassifyError::Processing(ProcessingError::Inference(_))
        ));

        let err = service
            .classify("broken.png", Bytes::from_static(b"not an image"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClassifyError::Processing(ProcessingError::Decode(_))
        ));

        let leftovers = std::fs::read_dir(tmp.path().join("uploads")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    struct DirectoryWatchingModel {
        dir: std::path::PathBuf,
        seen: Mutex<Vec<usize>>,
    }

    impl ModelService for DirectoryWatchingModel {
        fn predict(&self, _input: &Array4<f32>) -> Result<ArrayD<f32>, ModelError> {
            let count = std::fs::read_dir(&self.dir)
                .map(|entries| entries.count())
                .unwrap_or(0);
            self.seen.lock().unwrap().push(count);
            Ok(arr2(&[[1.0]]).into_dyn())
        }
    }

    #[tokio::test]
    async fn test_upload_is_removed_once_inference_finishes() {
        let tmp = tempfile::tempdir().unwrap();
        let model = Arc::new(DirectoryWatchingModel {
            dir: tmp.path().join("uploads"),
            seen: Mutex::new(Vec::new()),
        });
        let shared: Arc<dyn ModelService> = model.clone();
        let service = service(Some(shared), tmp.path());

        service
            .classify("cat.png", Bytes::from(png_bytes(16, 16)))
            .await
            .unwrap();

        assert_eq!(*model.seen.lock().unwrap(), vec![1]);
        let leftovers = std::fs::read_dir(tmp.path().join("uploads")).unwrap().count();
        assert_eq!(leftovers, 0);
    }
}
