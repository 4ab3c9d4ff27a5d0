//! MTOMO 손실 실험
//!
//! 링크 손실률을 in-network 측정과 멀티캐스트 토모그래피로 각각 구해 오차를 비교
//!
//! 사용법:
//!   cargo run --release --bin mtomo-loss -- [OPTIONS]
//!
//! 예시:
//!   # 독립 손실, 깊이 3, 10% 손실
//!   cargo run --release --bin mtomo-loss -- --depth 3 --loss 0.1
//!
//!   # 버스트 손실, 결과 저장
//!   cargo run --release --bin mtomo-loss -- -t gilbert_elliott -n 100000 --save loss.bin

use std::path::PathBuf;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use mtomo::{
    measure_bursts, run_loss_experiment, Config, EstimatorMode, GilbertElliott, LinkConfig,
    LossKind, LossModel,
};

/// 버스트 특성 측정 길이
const BURST_TICKS: u64 = 1_000_000;

/// 실행 설정
struct LossArgs {
    config: Config,
    save_path: Option<PathBuf>,
    verbose: bool,
}

fn parse_args() -> LossArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::bernoulli();
    let mut kind = LossKind::Bernoulli;
    let mut probability = 0.1;
    let mut save_path = None;
    let mut verbose = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--depth" | "-d" => {
                if i + 1 < args.len() {
                    config.depth = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--loss" | "-p" => {
                if i + 1 < args.len() {
                    probability = args[i + 1].parse().expect("유효한 확률 필요");
                    i += 1;
                }
            }
            "--loss-type" | "-t" => {
                if i + 1 < args.len() {
                    kind = args[i + 1].parse().expect("bernoulli 또는 gilbert_elliott");
                    i += 1;
                }
            }
            "--probes" | "-n" => {
                if i + 1 < args.len() {
                    config.num_probes = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--trials" => {
                if i + 1 < args.len() {
                    config.num_trials = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--seed" => {
                if i + 1 < args.len() {
                    config.base_seed = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--incremental" => {
                config.estimator_mode = EstimatorMode::Incremental;
            }
            "--workers" | "-w" => {
                if i + 1 < args.len() {
                    config.parallel_workers = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--save" | "-s" => {
                if i + 1 < args.len() {
                    save_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--verbose" | "-v" => {
                verbose = true;
            }
            "--help" | "-h" => {
                println!(
                    r#"MTOMO Loss - 멀티캐스트 손실 토모그래피 실험

수신자 관측만으로 내부 링크 손실률을 추정하고, 링크별 독립 측정과 오차를 비교

사용법:
  cargo run --release --bin mtomo-loss -- [OPTIONS]

옵션:
  -d, --depth <N>          이진 트리 깊이 (기본: 3)
  -p, --loss <P>           비루트 링크 손실 확률 0 < P < 1 (기본: 0.1)
  -t, --loss-type <TYPE>   bernoulli | gilbert_elliott (기본: bernoulli)
  -n, --probes <N>         시행당 프로브 수 (기본: 10000)
  --trials <N>             시행 수 (기본: 10)
  --seed <N>               첫 시행 시드 (기본: 1)
  --incremental            증분 추정기 사용 (기본: 배치)
  -w, --workers <N>        병렬 워커 수 (기본: CPU 코어 수)
  -s, --save <PATH>        bincode 리포트 저장 경로
  -v, --verbose            디버그 로그 출력
  -h, --help               이 도움말 출력

예시:
  # 독립 손실
  cargo run --release --bin mtomo-loss -- -d 4 -p 0.05 -n 100000

  # 버스트 손실 (수렴이 느리므로 프로브를 늘린다)
  cargo run --release --bin mtomo-loss -- -t gilbert_elliott -n 100000 --incremental
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    config.link = LinkConfig::Loss { kind, probability };
    LossArgs {
        config,
        save_path,
        verbose,
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = parse_args();

    // 로깅 설정
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = &args.config;
    info!("MTOMO loss experiment starting...");
    info!("Depth: {}", config.depth);
    info!("Link: {:?}", config.link);
    info!("Probes: {} x {} trials", config.num_probes, config.num_trials);
    info!("Estimator: {:?}", config.estimator_mode);

    if let LinkConfig::Loss {
        kind: LossKind::GilbertElliott,
        probability,
    } = config.link
    {
        let mut rng = StdRng::seed_from_u64(config.base_seed);
        let mut model = LossModel::GilbertElliott(GilbertElliott::new(probability, &mut rng)?);
        let profile = measure_bursts(&mut model, BURST_TICKS, &mut rng);
        info!(
            "Burst profile: drops={} bursts={} mean length={:.1}",
            profile.total_drops, profile.bursts, profile.mean_burst_len
        );
    }

    let report = run_loss_experiment(config)?;

    println!("{}", report.summary());
    if let Some(tomography) = report.stats.tomography() {
        println!(
            "avg. tomography error = {:.5}% (std {:.5}, {} trials)",
            tomography.mean, tomography.std_dev, tomography.count
        );
    } else {
        println!("avg. tomography error = undef");
    }
    if let Some(in_network) = report.stats.in_network() {
        println!(
            "avg. in-network error = {:.5}% ({} trials)",
            in_network.mean, in_network.count
        );
    }

    if let Some(path) = &args.save_path {
        report.save(path)?;
        info!("Report saved: {:?}", path);
    }

    Ok(())
}
