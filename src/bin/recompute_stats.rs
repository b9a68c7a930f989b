use chrono::Utc;

use karting_endurance::modules::models::driver::Driver;
use karting_endurance::modules::models::general::establish_connection;

pub fn main() {
    let connection = &mut establish_connection();
    let now = Utc::now().naive_utc();

    let drivers = Driver::get_all_active(connection).expect("Error loading drivers");
    for driver in drivers {
        println!("recomputing stats of driver: {} ", driver.name);
        Driver::recompute_aggregates(connection, driver.id, now)
            .expect("Error recomputing driver stats");
    }
}
