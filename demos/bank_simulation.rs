use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use simcore_rs::prelude::*;

struct Bank {
    tellers_free: usize,
    waiting: VecDeque<(String, f64)>,
    served: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Инициализируем логирование
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("🏦 Симуляция банка");
    println!("==================\n");

    let model = Model::with_base_seed("bank", 42);

    // Воспроизводимые потоки: интервалы прихода и время обслуживания
    let mut arrivals = StdRng::seed_from_u64(model.random_seed_for(1).await?);
    let mut services = StdRng::seed_from_u64(model.random_seed_for(2).await?);

    let bank = Arc::new(Mutex::new(Bank {
        tellers_free: 2,
        waiting: VecDeque::new(),
        served: 0,
    }));

    // Уход клиента: зовем следующего из очереди или освобождаем кассу
    let departure = Event::shared("departure");
    let departure_instance = EventInstance::of(&departure).await;
    {
        let bank = bank.clone();
        let next_departure = departure_instance.clone();
        departure.lock().await.add_handler(Box::new(move |ctx| {
            let mut bank = bank.lock().unwrap();
            bank.served += 1;
            if let Some((name, service)) = bank.waiting.pop_front() {
                println!("[{}] {} подходит к кассе из очереди", ctx.now(), name);
                ctx.schedule_in(Duration::from_seconds(service), next_departure.clone());
            } else {
                bank.tellers_free += 1;
            }
            Ok(())
        }));
    }

    // Создаем 5 клиентов с случайными, но воспроизводимыми интервалами
    let mut at = 0.0;
    for i in 1..=5 {
        at += arrivals.gen_range(2.0..5.0);
        let service = services.gen_range(3.0..7.0);
        let name = format!("client_{}", i);

        let arrival = Event::shared(&name);
        {
            let bank = bank.clone();
            let next_departure = departure_instance.clone();
            let label = name.clone();
            arrival.lock().await.add_handler(Box::new(move |ctx| {
                let mut bank = bank.lock().unwrap();
                if bank.tellers_free > 0 {
                    bank.tellers_free -= 1;
                    println!("[{}] {} обслуживается ({:.1} сек)", ctx.now(), label, service);
                    ctx.schedule_in(Duration::from_seconds(service), next_departure.clone());
                } else {
                    println!("[{}] {} встал в очередь", ctx.now(), label);
                    bank.waiting.push_back((label.clone(), service));
                }
                Ok(())
            }));
        }
        model
            .scheduler()
            .add(SimTime::new(at), EventInstance::of(&arrival).await)
            .await?;
    }

    // Запускаем симуляцию
    let state = model.run_until(SimTime::new(60.0)).await?;
    println!("\nПрогон завершен в состоянии {:?}", state);
    println!("Обслужено клиентов: {}", bank.lock().unwrap().served);

    // Выводим статистику
    println!("\n📊 Статистика симуляции:");
    println!("{}", serde_json::to_string_pretty(&model.get_stats().await)?);

    Ok(())
}
